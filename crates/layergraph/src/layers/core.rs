//! Core built-in layers: dense projection, dropout, and flatten.

use anyhow::{ensure, Context as _};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::layer::{CallContext, InputSpec, Layer};
use crate::tensor::{Dimension, Shape, Tensor};
use crate::weights::{WeightRole, WeightVisitor, WeightVisitorMut};

use super::{init, single_input};
use super::activations::ActivationFn;

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub units: usize,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    #[serde(default)]
    pub activation: ActivationFn,
    #[serde(default)]
    pub seed: u64,
}

/// Fully connected layer `y = act(x W + b)` over the last axis.
///
/// Weights are created on first use from the then-known input width; the
/// kernel is glorot-uniform from the configured seed, the bias zero.
#[derive(Debug)]
pub struct Dense {
    cfg: DenseConfig,
    kernel: Option<Tensor>,
    bias: Option<Tensor>,
}

impl Dense {
    pub fn new(units: usize) -> Self {
        Dense {
            cfg: DenseConfig {
                units,
                use_bias: true,
                activation: ActivationFn::Linear,
                seed: 0,
            },
            kernel: None,
            bias: None,
        }
    }

    pub fn with_activation(mut self, activation: ActivationFn) -> Self {
        self.cfg.activation = activation;
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.cfg.use_bias = use_bias;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.cfg.seed = seed;
        self
    }

    pub fn from_config(cfg: DenseConfig) -> Result<Self> {
        if cfg.units == 0 {
            return Err(Error::LayerConfig {
                layer: "dense".to_string(),
                message: "units must be positive".to_string(),
            });
        }
        Ok(Dense {
            cfg,
            kernel: None,
            bias: None,
        })
    }

    /// Input width the kernel was built for.
    pub fn input_width(&self) -> Option<usize> {
        self.kernel.as_ref().map(|kernel| kernel.dims()[0])
    }
}

impl Layer for Dense {
    fn kind(&self) -> &'static str {
        "dense"
    }

    fn built(&self) -> bool {
        self.kernel.is_some()
    }

    fn build(&mut self, input_shapes: &[Shape]) -> Result<()> {
        let shape = single_input(self.kind(), input_shapes)?;
        if self.cfg.units == 0 {
            return Err(Error::LayerConfig {
                layer: self.kind().to_string(),
                message: "units must be positive".to_string(),
            });
        }
        let features = match shape.dims().last() {
            Some(Dimension::Static(features)) => *features,
            _ => {
                return Err(Error::LayerConfig {
                    layer: self.kind().to_string(),
                    message: format!("last axis must be static to create weights, got {shape}"),
                })
            }
        };
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        self.kernel = Some(init::glorot_uniform(features, self.cfg.units, &mut rng)?);
        if self.cfg.use_bias {
            self.bias = Some(init::zeros(self.cfg.units));
        }
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let shape = single_input(self.kind(), input_shapes)?;
        let mut dims = shape.dims().to_vec();
        if dims.is_empty() {
            return Err(Error::LayerConfig {
                layer: self.kind().to_string(),
                message: "input must have rank >= 2".to_string(),
            });
        }
        let last = dims.len() - 1;
        dims[last] = Dimension::Static(self.cfg.units);
        Ok(vec![Shape::new(dims)])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        ensure!(inputs.len() == 1, "dense expects exactly one input");
        let x = &inputs[0];
        let kernel = self.kernel.as_ref().context("dense used before build")?;
        let dims = x.dims();
        ensure!(dims.len() >= 2, "dense expects rank >= 2, got {:?}", dims);
        let features = dims[dims.len() - 1];
        ensure!(
            features == kernel.dims()[0],
            "dense was built for width {}, got {}",
            kernel.dims()[0],
            features
        );

        let lead: usize = dims[..dims.len() - 1].iter().product();
        let mut out = x.reshaped([lead, features])?.matmul2d(kernel)?;
        if let Some(bias) = &self.bias {
            out = add_row_bias(&out, bias)?;
        }
        out = self.cfg.activation.apply(&out)?;

        let mut out_dims = dims.to_vec();
        out_dims[dims.len() - 1] = self.cfg.units;
        Ok(vec![out.reshaped(out_dims)?])
    }

    fn input_spec(&self) -> Vec<InputSpec> {
        let mut spec = InputSpec::min_rank(2);
        if let Some(width) = self.input_width() {
            spec = spec.with_axis(-1, width);
        }
        vec![spec]
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.cfg).unwrap_or(Value::Null)
    }

    fn visit_weights(&self, v: &mut WeightVisitor<'_>) -> Result<()> {
        if let Some(kernel) = &self.kernel {
            v.weight("kernel", WeightRole::Parameter, kernel)?;
        }
        if let Some(bias) = &self.bias {
            v.weight("bias", WeightRole::Parameter, bias)?;
        }
        Ok(())
    }

    fn visit_weights_mut(&mut self, v: &mut WeightVisitorMut<'_>) -> Result<()> {
        if let Some(kernel) = &mut self.kernel {
            v.weight("kernel", WeightRole::Parameter, kernel)?;
        }
        if let Some(bias) = &mut self.bias {
            v.weight("bias", WeightRole::Parameter, bias)?;
        }
        Ok(())
    }
}

fn add_row_bias(x: &Tensor, bias: &Tensor) -> anyhow::Result<Tensor> {
    let dims = x.dims();
    ensure!(dims.len() == 2, "bias add expects rank 2, got {:?}", dims);
    let cols = dims[1];
    ensure!(
        bias.len() == cols,
        "bias length {} does not match {} columns",
        bias.len(),
        cols
    );
    let values = x.as_f32()?;
    let bias_values = bias.as_f32()?;
    let out: Vec<f32> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| v + bias_values[i % cols])
        .collect();
    Tensor::from_vec(dims.to_vec(), out)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    pub rate: f32,
    #[serde(default)]
    pub seed: u64,
}

/// Zeroes a random fraction of elements in training, scaling the survivors
/// by `1 / (1 - rate)`; identity outside training.
#[derive(Clone, Debug)]
pub struct Dropout {
    cfg: DropoutConfig,
}

impl Dropout {
    pub fn new(rate: f32) -> Result<Self> {
        Self::from_config(DropoutConfig { rate, seed: 0 })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.cfg.seed = seed;
        self
    }

    pub fn from_config(cfg: DropoutConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&cfg.rate) {
            return Err(Error::LayerConfig {
                layer: "dropout".to_string(),
                message: format!("rate must be in [0, 1), got {}", cfg.rate),
            });
        }
        Ok(Dropout { cfg })
    }
}

impl Layer for Dropout {
    fn kind(&self) -> &'static str {
        "dropout"
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

    fn forward(&self, inputs: &[Tensor], ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        ensure!(inputs.len() == 1, "dropout expects exactly one input");
        let x = &inputs[0];
        if !ctx.training() || self.cfg.rate == 0.0 {
            return Ok(vec![x.clone()]);
        }
        let keep = 1.0 - self.cfg.rate;
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        let masked = x.map(|v| {
            if rng.gen::<f32>() < self.cfg.rate {
                0.0
            } else {
                v / keep
            }
        })?;
        Ok(vec![masked])
    }

    fn input_spec(&self) -> Vec<InputSpec> {
        vec![InputSpec::default()]
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.cfg).unwrap_or(Value::Null)
    }
}

/// Collapses every axis after the first into one.
#[derive(Clone, Debug, Default)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Flatten
    }
}

impl Layer for Flatten {
    fn kind(&self) -> &'static str {
        "flatten"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let shape = single_input(self.kind(), input_shapes)?;
        let dims = shape.dims();
        if dims.is_empty() {
            return Err(Error::LayerConfig {
                layer: self.kind().to_string(),
                message: "input must have rank >= 1".to_string(),
            });
        }
        let mut tail = Some(1usize);
        for dim in &dims[1..] {
            tail = match (tail, dim) {
                (Some(acc), Dimension::Static(extent)) => acc.checked_mul(*extent),
                _ => None,
            };
        }
        let tail = match tail {
            Some(extent) => Dimension::Static(extent),
            None => Dimension::Dynamic,
        };
        Ok(vec![Shape::new(vec![dims[0], tail])])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        ensure!(inputs.len() == 1, "flatten expects exactly one input");
        let x = &inputs[0];
        let dims = x.dims();
        ensure!(!dims.is_empty(), "flatten expects rank >= 1, got a scalar");
        let lead = dims[0];
        let tail: usize = dims[1..].iter().product();
        Ok(vec![x.reshaped([lead, tail])?])
    }

    fn input_spec(&self) -> Vec<InputSpec> {
        vec![InputSpec::min_rank(1)]
    }
}
