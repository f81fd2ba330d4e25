//! Symbolic layer-graph runtime: build graphs of named layers over typed,
//! shaped placeholder values, then evaluate any subset of them against fed
//! tensors with exactly-once node evaluation and early release of
//! intermediates.

pub mod config;
pub mod error;
pub mod exec;
pub mod graph;
pub mod layer;
pub mod layers;
pub mod tensor;
pub mod weights;

pub use config::{LayerRegistry, NetworkConfig};
pub use error::{Error, Result};
pub use exec::{ExecOptions, FeedMap, NodeContext, NodeStats, NodeStatus, RunStats, TraceSink};
pub use graph::{GraphTensor, LayerGraph, LayerHandle, Network};
pub use layer::{CallArgs, CallContext, InputSpec, Layer};
pub use tensor::{DType, Dimension, Shape, Tensor, TensorSpec};
pub use weights::{WeightRole, WeightSpec};
