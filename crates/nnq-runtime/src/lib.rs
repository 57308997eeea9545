//! Reference evaluator for nnq graphs.
//!
//! Executes floating-point and lowered fixed-point graphs on the CPU so the
//! two can be compared, and exposes every intermediate tensor so calibration
//! ranges can be recorded from a float run.

mod error;
mod evaluator;
pub mod kernels;

pub use error::RuntimeError;
pub use evaluator::{Evaluation, Evaluator, Tensor};
