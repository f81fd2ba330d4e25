//! Tensor metadata and host tensor values shared across the graph runtime.

mod dtype;
mod host_tensor;
mod shape;

pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::{Dimension, Shape, TensorSpec};
