//! Shared arena that stores layers, their invocations, and symbolic values.
//!
//! The arena is the central orchestrator for graph construction and
//! execution. Layers are registered once and addressed by stable handles;
//! every `apply` records a node and mints fresh symbolic values, and the
//! executor later resolves fetch requests against the recorded topology.
//!
//! ```text
//! GraphTensor / LayerHandle
//!      |
//!      | contain Arc<LayerGraph>
//!      v
//! LayerGraph
//!      |
//!      +-- GraphState (values, nodes, layer slots, names)
//!      |
//!      +-- PlanCache (topological orders keyed by fetches + feeds)
//! ```
//!
//! One mutex guards the whole state; `apply` and `execute` hold it for the
//! duration of the call, so executions against one arena are serialized. A
//! layer whose `forward` or `input_spec` re-enters its own arena deadlocks;
//! nested networks must therefore live on their own arena (see
//! [`Network`](super::network::Network)).

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex, MutexGuard,
};

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::exec::{execute, ExecOptions, FeedMap, PlanCache, DEFAULT_PLAN_CACHE_CAPACITY};
use crate::layer::{CallArgs, Layer};
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorSpec};

use super::state::{GraphState, LayerId, LayerSlot, NodeId, NodeRecord, Producer, ValueId};

static GRAPH_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Central storage for one layer graph.
pub struct LayerGraph {
    inner: Mutex<GraphState>,
    plans: Mutex<PlanCache>,
    id: usize,
}

impl LayerGraph {
    /// Creates an empty graph with the default plan-cache capacity.
    pub fn new() -> Arc<Self> {
        Self::with_plan_capacity(DEFAULT_PLAN_CACHE_CAPACITY)
    }

    /// Creates an empty graph whose plan cache holds up to `capacity`
    /// topological orders.
    pub fn with_plan_capacity(capacity: usize) -> Arc<Self> {
        let id = GRAPH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Arc::new(LayerGraph {
            inner: Mutex::new(GraphState::new()),
            plans: Mutex::new(PlanCache::new(capacity)),
            id,
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, GraphState> {
        self.inner.lock().expect("layer graph poisoned")
    }

    pub(crate) fn lock_plans(&self) -> MutexGuard<'_, PlanCache> {
        self.plans.lock().expect("plan cache poisoned")
    }

    /// Declares a producer-less input value.
    pub fn input(
        self: &Arc<Self>,
        name: impl Into<String>,
        shape: Shape,
        dtype: DType,
    ) -> Result<GraphTensor> {
        let name = name.into();
        let mut state = self.lock_state();
        if state.value_names.contains_key(&name) {
            return Err(Error::DuplicateInputName { name });
        }
        let spec = TensorSpec::new(dtype, shape);
        let id = state.fresh_value(name.clone(), spec.clone(), None);
        state.bump_version();
        Ok(GraphTensor {
            graph: Arc::clone(self),
            id,
            name,
            spec,
        })
    }

    /// Registers a layer under an auto-derived name (`kind`, `kind_1`, ...).
    ///
    /// Auto-naming cannot collide, so registration is infallible; explicit
    /// names go through [`LayerGraph::register_named`].
    pub fn register(self: &Arc<Self>, layer: impl Layer + 'static) -> LayerHandle {
        let base = layer.kind().to_string();
        let mut state = self.lock_state();
        let name = state.next_layer_name(&base);
        self.install(&mut state, name, Box::new(layer))
    }

    /// Registers a layer under an explicit name; duplicates are rejected.
    pub fn register_named(
        self: &Arc<Self>,
        name: impl Into<String>,
        layer: impl Layer + 'static,
    ) -> Result<LayerHandle> {
        self.register_boxed(name, Box::new(layer))
    }

    /// Boxed variant of [`LayerGraph::register_named`], used when layers come
    /// from a registry factory.
    pub fn register_boxed(
        self: &Arc<Self>,
        name: impl Into<String>,
        layer: Box<dyn Layer>,
    ) -> Result<LayerHandle> {
        let name = name.into();
        let mut state = self.lock_state();
        if state.layer_names.contains_key(&name) {
            return Err(Error::DuplicateLayerName { name });
        }
        Ok(self.install(&mut state, name, layer))
    }

    fn install(
        self: &Arc<Self>,
        state: &mut GraphState,
        name: String,
        layer: Box<dyn Layer>,
    ) -> LayerHandle {
        let id = LayerId(state.layers.len() as u32);
        state.layer_names.insert(name.clone(), id);
        state.layers.push(LayerSlot {
            name: name.clone(),
            layer,
            call_count: 0,
            built_shapes: None,
        });
        state.bump_version();
        LayerHandle {
            graph: Arc::clone(self),
            id,
            name,
        }
    }

    /// Looks up a registered layer by name.
    pub fn get_layer(self: &Arc<Self>, name: &str) -> Option<LayerHandle> {
        let state = self.lock_state();
        let id = *state.layer_names.get(name)?;
        Some(LayerHandle {
            graph: Arc::clone(self),
            id,
            name: name.to_string(),
        })
    }

    /// Records one invocation of `layer` on symbolic inputs.
    ///
    /// Builds the layer on first use, checks its input constraints, infers
    /// output shapes, and mints one fresh value per output. See
    /// [`LayerHandle::apply`] for the ergonomic entry point.
    pub fn apply(
        self: &Arc<Self>,
        layer: &LayerHandle,
        inputs: &[&GraphTensor],
        args: CallArgs,
    ) -> Result<Vec<GraphTensor>> {
        if !Arc::ptr_eq(self, &layer.graph) {
            return Err(Error::ForeignValue {
                value: layer.name.clone(),
            });
        }
        for input in inputs {
            if !Arc::ptr_eq(self, &input.graph) {
                return Err(Error::ForeignValue {
                    value: input.name.clone(),
                });
            }
        }

        let mut state = self.lock_state();
        let input_shapes: Vec<Shape> = inputs
            .iter()
            .map(|input| state.value(input.id).spec.shape.clone())
            .collect();
        let input_dtypes: Vec<DType> = inputs
            .iter()
            .map(|input| state.value(input.id).spec.dtype)
            .collect();

        let slot = state.layer_mut(layer.id);
        check_input_constraints(&slot.name, &*slot.layer, &input_shapes)?;
        if !slot.layer.built() {
            slot.layer
                .build(&input_shapes)
                .map_err(|err| attribute_config_error(&slot.name, err))?;
            slot.built_shapes = Some(input_shapes.clone());
            // Constraints may tighten during build (weight-bearing layers
            // pin their feature axes), so check again.
            check_input_constraints(&slot.name, &*slot.layer, &input_shapes)?;
        } else if let Some(built) = &slot.built_shapes {
            check_rebuild(&slot.name, built, &input_shapes)?;
        }

        let output_shapes = slot
            .layer
            .compute_output_shape(&input_shapes)
            .map_err(|err| attribute_config_error(&slot.name, err))?;
        let slot_count = output_shapes.len();
        let call_index = slot.call_count;
        slot.call_count += 1;
        let layer_name = slot.name.clone();
        let output_dtypes: Vec<DType> = (0..slot_count)
            .map(|slot_index| slot.layer.output_dtype(&input_dtypes, slot_index))
            .collect();

        let node = NodeId(state.nodes.len() as u32);
        let mut outputs = Vec::with_capacity(slot_count);
        for (slot_index, shape) in output_shapes.into_iter().enumerate() {
            let name = state.output_value_name(&layer_name, call_index, slot_index, slot_count);
            let spec = TensorSpec::new(output_dtypes[slot_index], shape);
            let id = state.fresh_value(
                name.clone(),
                spec.clone(),
                Some(Producer {
                    node,
                    index: slot_index,
                }),
            );
            outputs.push(GraphTensor {
                graph: Arc::clone(self),
                id,
                name,
                spec,
            });
        }

        let input_ids: SmallVec<[ValueId; 4]> = inputs.iter().map(|input| input.id).collect();
        let output_ids: SmallVec<[ValueId; 4]> = outputs.iter().map(|output| output.id).collect();
        let mut seen: SmallVec<[ValueId; 4]> = SmallVec::new();
        for &input in &input_ids {
            if !seen.contains(&input) {
                seen.push(input);
                state.values[input.0 as usize].consumers.push(node);
            }
        }
        state.nodes.push(NodeRecord {
            layer: layer.id,
            call_index,
            inputs: input_ids,
            outputs: output_ids,
            args,
        });
        state.bump_version();
        Ok(outputs)
    }

    /// Evaluates `fetches` against `feed`; see the executor contract in
    /// [`crate::exec`].
    pub fn execute(
        self: &Arc<Self>,
        fetches: &[&GraphTensor],
        feed: &FeedMap,
        options: &ExecOptions,
    ) -> Result<Vec<Tensor>> {
        for fetch in fetches {
            if !Arc::ptr_eq(self, &fetch.graph) {
                return Err(Error::ForeignValue {
                    value: fetch.name.clone(),
                });
            }
        }
        let ids: Vec<ValueId> = fetches.iter().map(|fetch| fetch.id).collect();
        execute(self, &ids, feed, options)
    }

    /// Number of values recorded so far.
    pub fn value_count(&self) -> usize {
        self.lock_state().values.len()
    }

    /// Number of nodes recorded so far.
    pub fn node_count(&self) -> usize {
        self.lock_state().nodes.len()
    }

    /// Times a layer has been applied, by handle.
    pub fn call_count(&self, layer: &LayerHandle) -> usize {
        self.lock_state().layer(layer.id).call_count
    }

    /// Number of execution plans currently cached.
    pub fn plan_count(&self) -> usize {
        self.lock_plans().len()
    }
}

impl fmt::Debug for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LayerGraph")
            .field("id", &self.id)
            .field("values", &state.values.len())
            .field("nodes", &state.nodes.len())
            .field("layers", &state.layers.len())
            .finish()
    }
}

/// Reattributes a configuration error raised inside layer code to the
/// registered layer name; layers only know their kind.
fn attribute_config_error(layer_name: &str, err: Error) -> Error {
    match err {
        Error::LayerConfig { message, .. } => Error::LayerConfig {
            layer: layer_name.to_string(),
            message,
        },
        other => other,
    }
}

fn check_input_constraints(
    layer_name: &str,
    layer: &dyn Layer,
    input_shapes: &[Shape],
) -> Result<()> {
    let specs = layer.input_spec();
    if specs.is_empty() {
        return Ok(());
    }
    if specs.len() != input_shapes.len() {
        return Err(Error::InputConstraint {
            layer: layer_name.to_string(),
            index: 0,
            message: format!(
                "expects {} inputs, got {}",
                specs.len(),
                input_shapes.len()
            ),
        });
    }
    for (index, (spec, shape)) in specs.iter().zip(input_shapes).enumerate() {
        if let Err(message) = spec.check(shape) {
            return Err(Error::InputConstraint {
                layer: layer_name.to_string(),
                index,
                message,
            });
        }
    }
    Ok(())
}

/// Re-invocation check for built layers: rank must match, and every
/// non-leading axis where both calls are static must agree. The leading
/// axis is treated as batch and may vary between calls.
fn check_rebuild(layer_name: &str, built: &[Shape], requested: &[Shape]) -> Result<()> {
    let mismatch = built.len() != requested.len()
        || built.iter().zip(requested).any(|(a, b)| {
            a.rank() != b.rank()
                || a.dims()
                    .iter()
                    .zip(b.dims())
                    .skip(1)
                    .any(|(x, y)| match (x, y) {
                        (Dimension::Static(x), Dimension::Static(y)) => x != y,
                        _ => false,
                    })
        });
    if mismatch {
        return Err(Error::IncompatibleRebuild {
            layer: layer_name.to_string(),
            built: built.to_vec(),
            requested: requested.to_vec(),
        });
    }
    Ok(())
}

/// User handle to one registered layer.
#[derive(Clone)]
pub struct LayerHandle {
    pub(crate) graph: Arc<LayerGraph>,
    pub(crate) id: LayerId,
    pub(crate) name: String,
}

impl LayerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn graph(&self) -> &Arc<LayerGraph> {
        &self.graph
    }

    /// Applies the layer with default call arguments.
    pub fn apply(&self, inputs: &[&GraphTensor]) -> Result<Vec<GraphTensor>> {
        self.graph.apply(self, inputs, CallArgs::default())
    }

    /// Applies the layer with explicit call arguments.
    pub fn apply_with(&self, inputs: &[&GraphTensor], args: CallArgs) -> Result<Vec<GraphTensor>> {
        self.graph.apply(self, inputs, args)
    }

    /// Single-output convenience wrapper around [`LayerHandle::apply`].
    pub fn call(&self, inputs: &[&GraphTensor]) -> Result<GraphTensor> {
        let mut outputs = self.apply(inputs)?;
        if outputs.len() != 1 {
            return Err(Error::Internal {
                message: format!(
                    "layer '{}' produced {} outputs where one was expected",
                    self.name,
                    outputs.len()
                ),
            });
        }
        Ok(outputs.remove(0))
    }

    /// Reports whether the underlying layer has been built.
    pub fn built(&self) -> bool {
        self.graph.lock_state().layer(self.id).layer.built()
    }
}

impl fmt::Debug for LayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// User handle to one symbolic value.
///
/// Carries the owning arena plus a cached copy of the value's name and spec;
/// the arena records stay the source of truth.
#[derive(Clone)]
pub struct GraphTensor {
    pub(crate) graph: Arc<LayerGraph>,
    pub(crate) id: ValueId,
    pub(crate) name: String,
    pub(crate) spec: TensorSpec,
}

impl GraphTensor {
    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn graph(&self) -> &Arc<LayerGraph> {
        &self.graph
    }

    /// The producing node and output slot, or `None` for graph inputs.
    pub fn producer(&self) -> Option<(NodeId, usize)> {
        let state = self.graph.lock_state();
        state
            .value(self.id)
            .producer
            .map(|producer| (producer.node, producer.index))
    }
}

impl fmt::Debug for GraphTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphTensor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("dtype", &self.spec.dtype)
            .field("shape", &format_args!("{}", self.spec.shape))
            .finish()
    }
}
