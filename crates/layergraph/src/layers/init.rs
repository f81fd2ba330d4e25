//! Seeded weight initializers used by the built-in layers.

use rand::Rng;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Samples a `[fan_in, fan_out]` matrix uniformly from `[-limit, limit]`
/// with `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform(fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Result<Tensor> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let values: Vec<f32> = (0..fan_in * fan_out)
        .map(|_| rng.gen_range(-limit..=limit))
        .collect();
    Tensor::from_vec([fan_in, fan_out], values).map_err(|err| Error::Internal {
        message: err.to_string(),
    })
}

/// A zero-filled vector of length `units`.
pub fn zeros(units: usize) -> Tensor {
    Tensor::zeros([units])
}
