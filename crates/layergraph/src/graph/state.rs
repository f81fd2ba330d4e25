//! Internal graph bookkeeping shared by the arena, network view, and executor.

use smallvec::SmallVec;
use std::collections::HashMap;

use crate::layer::{CallArgs, Layer};
use crate::tensor::{Shape, TensorSpec};

/// Identifies one symbolic value within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Identifies one recorded layer invocation within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Identifies one registered layer within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

/// Producing node and output slot of a non-input value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Producer {
    pub(crate) node: NodeId,
    pub(crate) index: usize,
}

/// Recorded metadata for one symbolic value.
pub(crate) struct ValueRecord {
    pub(crate) name: String,
    pub(crate) spec: TensorSpec,
    pub(crate) producer: Option<Producer>,
    /// Consuming nodes, one entry per node even when a node lists the value
    /// on several input slots.
    pub(crate) consumers: SmallVec<[NodeId; 4]>,
}

/// One recorded invocation of a layer.
pub(crate) struct NodeRecord {
    pub(crate) layer: LayerId,
    pub(crate) call_index: usize,
    pub(crate) inputs: SmallVec<[ValueId; 4]>,
    pub(crate) outputs: SmallVec<[ValueId; 4]>,
    pub(crate) args: CallArgs,
}

/// Registered layer instance plus its invocation bookkeeping.
pub(crate) struct LayerSlot {
    pub(crate) name: String,
    pub(crate) layer: Box<dyn Layer>,
    pub(crate) call_count: usize,
    /// Input shapes the layer was built against; `None` until a build runs
    /// (stateless layers never record any).
    pub(crate) built_shapes: Option<Vec<Shape>>,
}

/// Mutable graph storage protected by a mutex inside
/// [`LayerGraph`](super::arena::LayerGraph). Tracks every value, node, and
/// layer slot of one arena, plus the name-uniquifying state.
pub(crate) struct GraphState {
    pub(crate) values: Vec<ValueRecord>,
    pub(crate) nodes: Vec<NodeRecord>,
    pub(crate) layers: Vec<LayerSlot>,
    pub(crate) layer_names: HashMap<String, LayerId>,
    pub(crate) value_names: HashMap<String, ValueId>,
    name_counts: HashMap<String, usize>,
    pub(crate) version: u64,
}

impl GraphState {
    /// Constructs an empty graph state ready for incremental population.
    pub(crate) fn new() -> Self {
        GraphState {
            values: Vec::new(),
            nodes: Vec::new(),
            layers: Vec::new(),
            layer_names: HashMap::new(),
            value_names: HashMap::new(),
            name_counts: HashMap::new(),
            version: 0,
        }
    }

    pub(crate) fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub(crate) fn value(&self, id: ValueId) -> &ValueRecord {
        &self.values[id.0 as usize]
    }

    pub(crate) fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn layer(&self, id: LayerId) -> &LayerSlot {
        &self.layers[id.0 as usize]
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> &mut LayerSlot {
        &mut self.layers[id.0 as usize]
    }

    /// Allocates a fresh value record and registers its name.
    pub(crate) fn fresh_value(
        &mut self,
        name: String,
        spec: TensorSpec,
        producer: Option<Producer>,
    ) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.value_names.insert(name.clone(), id);
        self.values.push(ValueRecord {
            name,
            spec,
            producer,
            consumers: SmallVec::new(),
        });
        id
    }

    /// Produces the next free auto-name for `base`, appending a running
    /// counter once the bare base is taken (`dense`, `dense_1`, ...).
    pub(crate) fn next_layer_name(&mut self, base: &str) -> String {
        loop {
            let count = self.name_counts.entry(base.to_string()).or_insert(0);
            let candidate = if *count == 0 {
                base.to_string()
            } else {
                format!("{base}_{count}")
            };
            *count += 1;
            if !self.layer_names.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Derives a unique value name for one node output.
    ///
    /// The base is the layer name, suffixed with the invocation counter after
    /// the first call and with the output slot when the node has several
    /// outputs. A further counter is appended only if a user-chosen input
    /// name already occupies the candidate.
    pub(crate) fn output_value_name(
        &self,
        layer_name: &str,
        call_index: usize,
        slot: usize,
        slot_count: usize,
    ) -> String {
        let mut candidate = if call_index == 0 {
            layer_name.to_string()
        } else {
            format!("{layer_name}_{call_index}")
        };
        if slot_count > 1 {
            candidate = format!("{candidate}:{slot}");
        }
        if !self.value_names.contains_key(&candidate) {
            return candidate;
        }
        let mut attempt = 1usize;
        loop {
            let fallback = format!("{candidate}_{attempt}");
            if !self.value_names.contains_key(&fallback) {
                return fallback;
            }
            attempt += 1;
        }
    }
}
