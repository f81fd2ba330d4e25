//! Built-in layer implementations.

mod activations;
mod core;
mod merge;

pub mod init;

pub use activations::{Activation, ActivationConfig, ActivationFn};
pub use core::{Dense, DenseConfig, Dropout, DropoutConfig, Flatten};
pub use merge::{Add, Average, Concatenate, ConcatenateConfig, Multiply};

use crate::error::{Error, Result};
use crate::tensor::Shape;

/// Shared arity check for single-input layers.
pub(crate) fn single_input<'a>(kind: &str, input_shapes: &'a [Shape]) -> Result<&'a Shape> {
    match input_shapes {
        [shape] => Ok(shape),
        _ => Err(Error::LayerConfig {
            layer: kind.to_string(),
            message: format!("expects exactly one input, got {}", input_shapes.len()),
        }),
    }
}
