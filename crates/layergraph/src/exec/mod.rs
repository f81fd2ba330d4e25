//! Execution engine: feed maps, cached plans, tracing, and the evaluator.

mod executor;
mod feed;
mod plan;
mod trace;

pub use feed::FeedMap;
pub use plan::DEFAULT_PLAN_CACHE_CAPACITY;
pub use trace::{NodeContext, NodeStats, NodeStatus, RunStats, TraceSink};

pub(crate) use executor::execute;
pub(crate) use plan::PlanCache;

use std::sync::Arc;

/// Per-call execution options.
#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Training mode. Nodes recorded without an explicit flag inherit it,
    /// and no intermediate tensor is released while it is set.
    pub training: bool,
    /// Optional sink notified around each node evaluation.
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("training", &self.training)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}
