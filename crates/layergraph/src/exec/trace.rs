//! Observation hooks around executor passes.
//!
//! A sink is installed per call through [`ExecOptions`](super::ExecOptions);
//! there is no global registry. Callbacks run under the graph lock, so they
//! must not call back into the same graph.

use std::time::Duration;

use crate::graph::{NodeId, ValueId};

/// Identifies one node evaluation within a run.
#[derive(Clone, Debug)]
pub struct NodeContext {
    pub node: NodeId,
    pub layer: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

/// Timing of one node evaluation.
#[derive(Clone, Debug)]
pub struct NodeStats {
    pub duration: Duration,
}

/// Outcome of one node evaluation.
#[derive(Clone, Debug)]
pub enum NodeStatus {
    Success,
    Failure { message: String },
}

/// Summary of one executor run.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Forward calls actually made; sibling-output and feed short-circuits
    /// do not count.
    pub nodes_evaluated: usize,
    /// Intermediate tensors dropped before the run finished.
    pub values_released: usize,
    /// Whether the topological order came from the plan cache.
    pub plan_cached: bool,
    pub duration: Duration,
}

/// Receives executor callbacks.
pub trait TraceSink: Send + Sync {
    fn before_node(&self, _ctx: &NodeContext) {}
    fn after_node(&self, _ctx: &NodeContext, _stats: &NodeStats, _status: &NodeStatus) {}
    fn after_run(&self, _stats: &RunStats) {}
}
