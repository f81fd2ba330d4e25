//! N-ary merge layers combining same-shaped inputs.

use anyhow::ensure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::layer::{CallContext, Layer};
use crate::tensor::{Dimension, Shape, Tensor};

/// Unifies pairwise-compatible shapes, resolving each axis to the static
/// extent when any input pins one.
fn unified_shape(kind: &str, input_shapes: &[Shape]) -> Result<Shape> {
    if input_shapes.len() < 2 {
        return Err(Error::LayerConfig {
            layer: kind.to_string(),
            message: format!("expects at least two inputs, got {}", input_shapes.len()),
        });
    }
    let mut acc = input_shapes[0].clone();
    for shape in &input_shapes[1..] {
        if !acc.compatible_with(shape) {
            return Err(Error::LayerConfig {
                layer: kind.to_string(),
                message: format!("inputs have incompatible shapes {acc} and {shape}"),
            });
        }
        let dims: Vec<Dimension> = acc
            .dims()
            .iter()
            .zip(shape.dims())
            .map(|(a, b)| match (a, b) {
                (Dimension::Static(extent), _) | (_, Dimension::Static(extent)) => {
                    Dimension::Static(*extent)
                }
                _ => Dimension::Dynamic,
            })
            .collect();
        acc = Shape::new(dims);
    }
    Ok(acc)
}

fn check_forward_arity(kind: &str, inputs: &[Tensor]) -> anyhow::Result<()> {
    ensure!(
        inputs.len() >= 2,
        "{} expects at least two inputs, got {}",
        kind,
        inputs.len()
    );
    Ok(())
}

macro_rules! elementwise_merge {
    ($name:ident, $kind:literal, $doc:literal, $combine:expr) => {
        #[doc = $doc]
        #[derive(Clone, Debug, Default)]
        pub struct $name;

        impl $name {
            pub fn new() -> Self {
                $name
            }
        }

        impl Layer for $name {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn built(&self) -> bool {
                true
            }

            fn build(&mut self, _input_shapes: &[Shape]) -> Result<()> {
                Ok(())
            }

            fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
                Ok(vec![unified_shape(self.kind(), input_shapes)?])
            }

            fn forward(
                &self,
                inputs: &[Tensor],
                _ctx: &CallContext<'_>,
            ) -> anyhow::Result<Vec<Tensor>> {
                check_forward_arity(self.kind(), inputs)?;
                let mut acc = inputs[0].clone();
                for rhs in &inputs[1..] {
                    acc = acc.zip_map(rhs, $combine)?;
                }
                $name::finish(acc, inputs.len())
            }
        }
    };
}

elementwise_merge!(Add, "add", "Elementwise sum of its inputs.", |a, b| a + b);
elementwise_merge!(
    Multiply,
    "multiply",
    "Elementwise product of its inputs.",
    |a, b| a * b
);
elementwise_merge!(
    Average,
    "average",
    "Elementwise arithmetic mean of its inputs.",
    |a, b| a + b
);

impl Add {
    fn finish(acc: Tensor, _count: usize) -> anyhow::Result<Vec<Tensor>> {
        Ok(vec![acc])
    }
}

impl Multiply {
    fn finish(acc: Tensor, _count: usize) -> anyhow::Result<Vec<Tensor>> {
        Ok(vec![acc])
    }
}

impl Average {
    fn finish(acc: Tensor, count: usize) -> anyhow::Result<Vec<Tensor>> {
        let scale = 1.0 / count as f32;
        Ok(vec![acc.map(|v| v * scale)?])
    }
}

fn default_axis() -> isize {
    -1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcatenateConfig {
    #[serde(default = "default_axis")]
    pub axis: isize,
}

/// Joins inputs along one axis; every other axis must agree.
#[derive(Clone, Debug)]
pub struct Concatenate {
    cfg: ConcatenateConfig,
}

impl Concatenate {
    /// Joins along `axis`; negative values count from the end.
    pub fn new(axis: isize) -> Self {
        Concatenate {
            cfg: ConcatenateConfig { axis },
        }
    }

    pub fn from_config(cfg: ConcatenateConfig) -> Self {
        Concatenate { cfg }
    }

    fn resolve_axis(&self, rank: usize) -> Result<usize> {
        let axis = self.cfg.axis;
        let resolved = if axis < 0 {
            let back = axis.unsigned_abs();
            if back > rank {
                None
            } else {
                Some(rank - back)
            }
        } else if (axis as usize) < rank {
            Some(axis as usize)
        } else {
            None
        };
        resolved.ok_or_else(|| Error::LayerConfig {
            layer: self.kind().to_string(),
            message: format!("axis {axis} out of range for rank {rank}"),
        })
    }
}

impl Layer for Concatenate {
    fn kind(&self) -> &'static str {
        "concatenate"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        if input_shapes.len() < 2 {
            return Err(Error::LayerConfig {
                layer: self.kind().to_string(),
                message: format!("expects at least two inputs, got {}", input_shapes.len()),
            });
        }
        let rank = input_shapes[0].rank();
        let axis = self.resolve_axis(rank)?;
        for shape in input_shapes {
            if shape.rank() != rank {
                return Err(Error::LayerConfig {
                    layer: self.kind().to_string(),
                    message: format!(
                        "inputs disagree on rank: {} and {}",
                        input_shapes[0], shape
                    ),
                });
            }
        }

        let mut dims = Vec::with_capacity(rank);
        for index in 0..rank {
            if index == axis {
                let mut joined = Some(0usize);
                for shape in input_shapes {
                    joined = match (joined, shape.dims()[index]) {
                        (Some(acc), Dimension::Static(extent)) => Some(acc + extent),
                        _ => None,
                    };
                }
                dims.push(match joined {
                    Some(extent) => Dimension::Static(extent),
                    None => Dimension::Dynamic,
                });
                continue;
            }
            let mut unified = Dimension::Dynamic;
            for shape in input_shapes {
                match (unified, shape.dims()[index]) {
                    (Dimension::Static(a), Dimension::Static(b)) if a != b => {
                        return Err(Error::LayerConfig {
                            layer: self.kind().to_string(),
                            message: format!(
                                "inputs disagree on axis {index}: {} and {}",
                                input_shapes[0], shape
                            ),
                        });
                    }
                    (Dimension::Dynamic, Dimension::Static(extent)) => {
                        unified = Dimension::Static(extent);
                    }
                    _ => {}
                }
            }
            dims.push(unified);
        }
        Ok(vec![Shape::new(dims)])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        check_forward_arity(self.kind(), inputs)?;
        let axis = self.resolve_axis(inputs[0].dims().len())?;
        Ok(vec![Tensor::concat(inputs, axis)?])
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.cfg).unwrap_or(Value::Null)
    }
}
