//! Cached topological orders keyed by fetch and feed identity.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::graph::ValueId;

pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

/// Cache key: sorted, deduplicated fetch and feed ids.
///
/// Fetch order and multiplicity do not change the dependency closure, so
/// normalizing here lets permuted fetch lists share one plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PlanKey {
    fetches: Vec<ValueId>,
    feeds: Vec<ValueId>,
}

impl PlanKey {
    pub(crate) fn new(fetches: &[ValueId], feed_ids: impl Iterator<Item = ValueId>) -> Self {
        let mut fetches = fetches.to_vec();
        fetches.sort_unstable();
        fetches.dedup();
        let mut feeds: Vec<ValueId> = feed_ids.collect();
        feeds.sort_unstable();
        feeds.dedup();
        PlanKey { fetches, feeds }
    }
}

/// Topological order plus recipient counts for one (fetches, feeds) pair.
pub(crate) struct ExecPlan {
    /// Values in dependency order; every entry has a producer and never
    /// precedes that producer's inputs.
    pub(crate) order: Vec<ValueId>,
    /// Distinct downstream consuming values per value; cloned per run since
    /// the evaluation pass consumes the counts.
    pub(crate) recipients: HashMap<ValueId, usize>,
    /// Arena version the plan was computed against.
    pub(crate) version: u64,
}

/// LRU cache of execution plans, one instance per arena.
pub(crate) struct PlanCache {
    cache: LruCache<PlanKey, Arc<ExecPlan>>,
}

impl PlanCache {
    pub(crate) fn new(capacity: usize) -> Self {
        PlanCache {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Returns the cached plan for `key` unless the arena has moved past the
    /// version it was computed against; stale entries are evicted.
    pub(crate) fn get(&mut self, key: &PlanKey, version: u64) -> Option<Arc<ExecPlan>> {
        match self.cache.get(key) {
            Some(plan) if plan.version == version => Some(Arc::clone(plan)),
            Some(_) => {
                self.cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn insert(&mut self, key: PlanKey, plan: Arc<ExecPlan>) {
        self.cache.put(key, plan);
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}
