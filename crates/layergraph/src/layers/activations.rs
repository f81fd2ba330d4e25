//! Named activation functions and the layer wrapping them.

use anyhow::ensure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::layer::{CallContext, InputSpec, Layer};
use crate::tensor::{Shape, Tensor};

use super::single_input;

/// Elementwise non-linearity selectable by name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFn {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    /// Normalizes along the last axis.
    Softmax,
}

impl ActivationFn {
    /// Applies the function to an `f32` tensor.
    pub fn apply(self, x: &Tensor) -> anyhow::Result<Tensor> {
        match self {
            ActivationFn::Linear => Ok(x.clone()),
            ActivationFn::Relu => x.map(|v| v.max(0.0)),
            ActivationFn::Sigmoid => x.map(|v| 1.0 / (1.0 + (-v).exp())),
            ActivationFn::Tanh => x.map(f32::tanh),
            ActivationFn::Softmax => softmax_last_axis(x),
        }
    }
}

fn softmax_last_axis(x: &Tensor) -> anyhow::Result<Tensor> {
    let dims = x.dims();
    ensure!(!dims.is_empty(), "softmax requires rank >= 1");
    let cols = dims[dims.len() - 1];
    ensure!(cols > 0, "softmax requires a non-empty last axis");
    let values = x.as_f32()?;
    let mut out = Vec::with_capacity(values.len());
    for row in values.chunks(cols) {
        let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        out.extend(exps.iter().map(|&e| e / sum));
    }
    Tensor::from_vec(dims.to_vec(), out)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationConfig {
    pub activation: ActivationFn,
}

/// Applies a named activation as a standalone layer.
#[derive(Clone, Debug)]
pub struct Activation {
    cfg: ActivationConfig,
}

impl Activation {
    pub fn new(activation: ActivationFn) -> Self {
        Activation {
            cfg: ActivationConfig { activation },
        }
    }

    pub fn from_config(cfg: ActivationConfig) -> Self {
        Activation { cfg }
    }
}

impl Layer for Activation {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let shape = single_input(self.kind(), input_shapes)?;
        Ok(vec![shape.clone()])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        ensure!(inputs.len() == 1, "activation expects exactly one input");
        Ok(vec![self.cfg.activation.apply(&inputs[0])?])
    }

    fn input_spec(&self) -> Vec<InputSpec> {
        vec![InputSpec::default()]
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.cfg).unwrap_or(Value::Null)
    }
}
