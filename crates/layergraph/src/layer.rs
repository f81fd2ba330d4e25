//! The layer capability: build, shape inference, and forward evaluation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::tensor::{DType, Dimension, Shape, Tensor};
use crate::weights::{WeightVisitor, WeightVisitorMut};

/// Non-tensor arguments recorded with each layer invocation.
///
/// Stored on the node so the call can be reproduced from a description. The
/// training override, when present, takes precedence over the flag passed
/// to `execute`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Arguments carrying only a training override.
    pub fn training(flag: bool) -> Self {
        CallArgs {
            training: Some(flag),
            extra: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.training.is_none() && self.extra.is_empty()
    }
}

/// Call-scoped context handed to [`Layer::forward`].
pub struct CallContext<'a> {
    training: bool,
    args: &'a CallArgs,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(training: bool, args: &'a CallArgs) -> Self {
        Self { training, args }
    }

    /// Resolved training flag: the node's override when set, otherwise the
    /// execute-wide flag.
    pub fn training(&self) -> bool {
        self.training
    }

    /// The non-tensor arguments recorded at apply time.
    pub fn args(&self) -> &CallArgs {
        self.args
    }
}

/// Per-input constraint a layer may declare, checked before building.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputSpec {
    /// Inclusive lower bound on rank.
    pub min_rank: Option<usize>,
    /// Inclusive upper bound on rank.
    pub max_rank: Option<usize>,
    /// Required static extents per axis; negative axes count from the end.
    pub axes: Vec<(isize, usize)>,
}

impl InputSpec {
    pub fn min_rank(rank: usize) -> Self {
        InputSpec {
            min_rank: Some(rank),
            ..InputSpec::default()
        }
    }

    pub fn exact_rank(rank: usize) -> Self {
        InputSpec {
            min_rank: Some(rank),
            max_rank: Some(rank),
            ..InputSpec::default()
        }
    }

    pub fn with_axis(mut self, axis: isize, extent: usize) -> Self {
        self.axes.push((axis, extent));
        self
    }

    /// Checks a symbolic shape, returning a human-readable violation.
    ///
    /// Dynamic axes pass static-extent checks; they are pinned only once a
    /// concrete tensor arrives through the feed.
    pub fn check(&self, shape: &Shape) -> std::result::Result<(), String> {
        let rank = shape.rank();
        if let Some(min) = self.min_rank {
            if rank < min {
                return Err(format!("expected rank >= {min}, got shape {shape}"));
            }
        }
        if let Some(max) = self.max_rank {
            if rank > max {
                return Err(format!("expected rank <= {max}, got shape {shape}"));
            }
        }
        for &(axis, extent) in &self.axes {
            let index = if axis < 0 {
                let back = axis.unsigned_abs();
                if back > rank {
                    return Err(format!("axis {axis} out of range for shape {shape}"));
                }
                rank - back
            } else {
                let index = axis as usize;
                if index >= rank {
                    return Err(format!("axis {axis} out of range for shape {shape}"));
                }
                index
            };
            if let Dimension::Static(actual) = shape.dims()[index] {
                if actual != extent {
                    return Err(format!(
                        "axis {axis} must have extent {extent}, got shape {shape}"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named, possibly stateful transformation over tensors.
///
/// One instance may be applied at several graph positions; every application
/// is recorded as a node. `forward` must be pure in its arguments apart from
/// reading the layer's own weights.
pub trait Layer: fmt::Debug + Send {
    /// Stable type tag used by serializers and the layer registry.
    fn kind(&self) -> &'static str;

    /// Reports whether weight shapes are fixed.
    fn built(&self) -> bool;

    /// Creates weights for the given input shapes.
    ///
    /// Called at most once per instance, before the first forward; weight
    /// counts and shapes are frozen afterwards.
    fn build(&mut self, input_shapes: &[Shape]) -> Result<()>;

    /// Infers output shapes from symbolic input shapes without evaluating.
    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>>;

    /// Chooses the dtype of one output slot; defaults to the first input's
    /// dtype.
    fn output_dtype(&self, input_dtypes: &[DType], output_index: usize) -> DType {
        let _ = output_index;
        input_dtypes.first().copied().unwrap_or(DType::F32)
    }

    /// Evaluates the layer on concrete tensors.
    fn forward(&self, inputs: &[Tensor], ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>>;

    /// Constraints checked against symbolic input shapes at apply time.
    ///
    /// An empty list (the default) accepts any inputs; otherwise one entry
    /// per expected input.
    fn input_spec(&self) -> Vec<InputSpec> {
        Vec::new()
    }

    /// Serializable configuration payload consumed by a registry factory.
    fn config(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    fn visit_weights(&self, _v: &mut WeightVisitor<'_>) -> Result<()> {
        Ok(())
    }

    fn visit_weights_mut(&mut self, _v: &mut WeightVisitorMut<'_>) -> Result<()> {
        Ok(())
    }
}
