//! nnq intermediate representation.
//!
//! An arena-based dataflow graph of tensor operators, with the operator
//! catalog and quantization parameter types shared by the lowering passes.

pub mod arena;
mod display;
mod error;
pub mod graph;
pub mod ops;
mod quant;
mod types;

pub use arena::{Arena, Handle};
pub use display::dump_graph;
pub use error::IrError;
pub use graph::{Graph, InputConnector, InputId, Node, NodeId, OutputConnector, OutputId};
pub use ops::{Conv2d, NodeOp, OpKind, QuantizedConv2d, Signature, windowed_output_size};
pub use quant::{FixedMul, QuantParam, ValueRange};
pub use types::{Attributes, Bytes, Padding, Scalar, ScalarKind, Shape, TensorType};
