//! Error types for the graph IR.

use crate::graph::NodeId;

/// Errors that can occur when building or rewiring a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A node handle does not refer to a live node.
    #[error("node {0} does not exist or was removed")]
    BadHandle(NodeId),

    /// A connector index is out of bounds for its node.
    #[error("node {node} has no {direction} connector #{index}")]
    BadConnector {
        node: NodeId,
        direction: &'static str,
        index: u32,
    },

    /// A connection or node construction would join incompatible tensor types.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The graph contains a cycle.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// Designated graph inputs and outputs cannot be removed.
    #[error("node '{0}' is a designated graph input or output")]
    DesignatedNode(String),
}
