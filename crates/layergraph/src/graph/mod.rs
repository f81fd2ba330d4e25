//! Layer-graph construction: the arena, symbolic tensors, and networks.

mod arena;
mod network;
mod state;

pub use arena::{GraphTensor, LayerGraph, LayerHandle};
pub use network::Network;
pub use state::{LayerId, NodeId, ValueId};

pub(crate) use state::GraphState;
