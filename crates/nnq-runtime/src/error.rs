use nnq_ir::{IrError, TensorType};

use crate::kernels::KernelError;

/// Errors that can occur while evaluating a graph.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no value supplied for graph input '{0}'")]
    MissingInput(String),

    /// A tensor reaching a node does not have the connector's type.
    #[error("node '{node}': expected {expected}, found {found}")]
    TypeMismatch {
        node: String,
        expected: TensorType,
        found: TensorType,
    },

    #[error("node '{node}' input #{index} is unconnected")]
    Unconnected { node: String, index: u32 },

    #[error("node '{node}': {source}")]
    Kernel {
        node: String,
        #[source]
        source: KernelError,
    },

    #[error(transparent)]
    Ir(#[from] IrError),
}
