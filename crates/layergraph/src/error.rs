//! Crate-wide error taxonomy for graph construction and execution.

use thiserror::Error;

use crate::graph::NodeId;
use crate::tensor::{DType, Shape};

/// Errors surfaced by the layer-graph runtime.
///
/// Feed and execution variants always name the symbolic value or layer they
/// refer to so failures stay attributable without a debugger.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration for layer '{layer}': {message}")]
    LayerConfig { layer: String, message: String },

    #[error("layer '{layer}' was built for input shapes {built:?} and cannot accept {requested:?}")]
    IncompatibleRebuild {
        layer: String,
        built: Vec<Shape>,
        requested: Vec<Shape>,
    },

    #[error("layer name '{name}' is already registered on this graph")]
    DuplicateLayerName { name: String },

    #[error("input name '{name}' is already used on this graph")]
    DuplicateInputName { name: String },

    #[error("input {index} of layer '{layer}' violates its constraint: {message}")]
    InputConstraint {
        layer: String,
        index: usize,
        message: String,
    },

    #[error("unknown layer kind '{kind}'")]
    UnknownLayerKind { kind: String },

    #[error("failed to decode '{kind}' layer config: {source}")]
    LayerConfigDecode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("value '{value}' belongs to a different graph")]
    ForeignValue { value: String },

    #[error("value '{value}' has no producer and is not a declared input")]
    DisconnectedInput { value: String },

    #[error("cycle detected through layer '{layer}'")]
    CycleDetected { layer: String },

    #[error("network requires at least one input and one output value")]
    EmptyFrontier,

    #[error("invalid network description: {message}")]
    InvalidDescription { message: String },

    #[error("feed already contains a value for '{value}'")]
    DuplicateFeed { value: String },

    #[error("feed value for '{value}' expects shape {expected}, got {actual:?}")]
    FeedShapeMismatch {
        value: String,
        expected: Shape,
        actual: Vec<usize>,
    },

    #[error("feed value for '{value}' expects dtype {expected} and no safe cast exists from {actual}")]
    FeedDtypeMismatch {
        value: String,
        expected: DType,
        actual: DType,
    },

    #[error("feed has no value for '{value}'")]
    MissingKey { value: String },

    #[error("missing feed for graph input '{value}'")]
    MissingFeed { value: String },

    #[error("layer '{layer}' failed while evaluating node {node:?}")]
    LayerInvocation {
        layer: String,
        node: NodeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown weight '{name}'")]
    UnknownWeight { name: String },

    #[error("weight '{name}' expects dims {expected:?}, got {actual:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("weight '{name}' expects dtype {expected}, got {actual}")]
    WeightDtypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },

    #[error("internal graph invariant violated: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
