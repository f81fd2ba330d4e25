//! Frozen (inputs, outputs) view over an arena, itself usable as a layer.
//!
//! A [`Network`] pins down which values are the model boundary and caches
//! the dependency closure between them: the reachable layers and nodes, and
//! the nodes grouped by topological depth. Construction validates that the
//! closure bottoms out at the declared inputs; execution just forwards to
//! the owning arena with the declared outputs as fetches.
//!
//! Networks nest: registering one as a layer in another arena records
//! ordinary nodes there, while its own values stay on the inner arena with
//! an independent lock and plan cache. Registering a network into the arena
//! it was built on deadlocks (see the arena module doc).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use log::warn;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::exec::{ExecOptions, FeedMap};
use crate::layer::{CallContext, InputSpec, Layer};
use crate::tensor::{DType, Dimension, Shape, Tensor};
use crate::weights::{
    check_assignment, WeightRole, WeightSpec, WeightVisitor, WeightVisitorMut,
};

use super::arena::{GraphTensor, LayerGraph, LayerHandle};
use super::state::{GraphState, LayerId, LayerSlot, NodeId, ValueId};

/// Immutable (inputs, outputs) closure over one arena.
#[derive(Clone)]
pub struct Network {
    pub(crate) graph: Arc<LayerGraph>,
    pub(crate) name: String,
    pub(crate) inputs: Vec<GraphTensor>,
    pub(crate) outputs: Vec<GraphTensor>,
    /// Reachable layers in registration order.
    pub(crate) layers: Vec<LayerId>,
    /// Reachable nodes grouped by depth; depth 0 is nearest the outputs.
    nodes_by_depth: Vec<Vec<NodeId>>,
}

impl Network {
    /// Builds a network named `"network"`; see [`Network::named`].
    pub fn new(
        graph: &Arc<LayerGraph>,
        inputs: Vec<GraphTensor>,
        outputs: Vec<GraphTensor>,
    ) -> Result<Self> {
        Self::named("network", graph, inputs, outputs)
    }

    /// Builds a named network after validating the (inputs, outputs) closure.
    ///
    /// Every producer-less value reachable from `outputs` must be declared in
    /// `inputs`; declared inputs that feed no output are kept but logged.
    pub fn named(
        name: impl Into<String>,
        graph: &Arc<LayerGraph>,
        inputs: Vec<GraphTensor>,
        outputs: Vec<GraphTensor>,
    ) -> Result<Self> {
        let name = name.into();
        if inputs.is_empty() || outputs.is_empty() {
            return Err(Error::EmptyFrontier);
        }
        for value in inputs.iter().chain(&outputs) {
            if !Arc::ptr_eq(graph, &value.graph) {
                return Err(Error::ForeignValue {
                    value: value.name.clone(),
                });
            }
        }

        let mut input_ids: HashSet<ValueId> = HashSet::new();
        for input in &inputs {
            if !input_ids.insert(input.id) {
                return Err(Error::DuplicateInputName {
                    name: input.name.clone(),
                });
            }
        }

        let state = graph.lock_state();
        for input in &inputs {
            if state.value(input.id).producer.is_some() {
                return Err(Error::InvalidDescription {
                    message: format!(
                        "input '{}' is produced by a layer; network inputs must be producer-less",
                        input.name
                    ),
                });
            }
        }

        let fetch_ids: Vec<ValueId> = outputs.iter().map(|output| output.id).collect();
        let (visited, node_order) = walk_closure(&state, &fetch_ids, &input_ids)?;

        for input in &inputs {
            if !visited.contains(&input.id) {
                warn!(
                    "network '{}': input '{}' is not an ancestor of any output",
                    name, input.name
                );
            }
        }

        let mut layers: Vec<LayerId> = node_order
            .iter()
            .map(|&node| state.node(node).layer)
            .collect();
        layers.sort_unstable();
        layers.dedup();

        let nodes_by_depth = group_by_depth(&state, &node_order);
        drop(state);

        Ok(Network {
            graph: Arc::clone(graph),
            name,
            inputs,
            outputs,
            layers,
            nodes_by_depth,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<LayerGraph> {
        &self.graph
    }

    pub fn inputs(&self) -> &[GraphTensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[GraphTensor] {
        &self.outputs
    }

    /// Reachable nodes grouped by depth; index 0 holds the nodes nearest the
    /// outputs, and iterating in reverse yields a valid evaluation order.
    pub fn nodes_by_depth(&self) -> &[Vec<NodeId>] {
        &self.nodes_by_depth
    }

    /// Handles to the reachable layers, in registration order.
    pub fn layer_handles(&self) -> Vec<LayerHandle> {
        let state = self.graph.lock_state();
        self.layers
            .iter()
            .map(|&id| LayerHandle {
                graph: Arc::clone(&self.graph),
                id,
                name: state.layer(id).name.clone(),
            })
            .collect()
    }

    /// Evaluates all declared outputs against `feed`.
    pub fn run(&self, feed: &FeedMap) -> Result<Vec<Tensor>> {
        self.run_with(feed, &ExecOptions::default())
    }

    /// Evaluates all declared outputs with explicit execution options.
    pub fn run_with(&self, feed: &FeedMap, options: &ExecOptions) -> Result<Vec<Tensor>> {
        let fetches: Vec<&GraphTensor> = self.outputs.iter().collect();
        self.graph.execute(&fetches, feed, options)
    }

    /// Evaluates the outputs on tensors matched positionally to the declared
    /// inputs.
    pub fn run_on(&self, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
        let feed = self.positional_feed(tensors)?;
        self.run(&feed)
    }

    fn positional_feed(&self, tensors: &[Tensor]) -> Result<FeedMap> {
        if tensors.len() != self.inputs.len() {
            return Err(Error::InputConstraint {
                layer: self.name.clone(),
                index: 0,
                message: format!(
                    "expects {} inputs, got {}",
                    self.inputs.len(),
                    tensors.len()
                ),
            });
        }
        let mut feed = FeedMap::new();
        for (input, tensor) in self.inputs.iter().zip(tensors) {
            feed.insert(input, tensor.clone())?;
        }
        Ok(feed)
    }

    /// Flat weight descriptors over the reachable layers, scoped by layer
    /// name, in registration order.
    pub fn weight_specs(&self) -> Result<Vec<WeightSpec>> {
        let mut specs = Vec::new();
        let mut collect = |name: &str, role: WeightRole, tensor: &Tensor| -> Result<()> {
            specs.push(WeightSpec::of(name, role, tensor));
            Ok(())
        };
        let mut visitor = WeightVisitor::new(&mut collect);
        self.visit_weights(&mut visitor)?;
        Ok(specs)
    }

    /// Assigns weights by dotted name.
    ///
    /// Every entry must match an existing weight in shape and dtype; entries
    /// naming no weight fail. Weights without an entry keep their current
    /// value and are counted in a warning.
    pub fn load_weights(&mut self, entries: &[(String, Tensor)]) -> Result<()> {
        let mut remaining: HashMap<&str, &Tensor> = HashMap::with_capacity(entries.len());
        for (name, tensor) in entries {
            if remaining.insert(name.as_str(), tensor).is_some() {
                return Err(Error::Internal {
                    message: format!("duplicate weight entry '{name}'"),
                });
            }
        }

        let mut visited = 0usize;
        let mut assigned = 0usize;
        let mut assign = |name: &str, _role: WeightRole, tensor: &mut Tensor| -> Result<()> {
            visited += 1;
            if let Some(incoming) = remaining.remove(name) {
                check_assignment(name, tensor, incoming)?;
                *tensor = incoming.clone();
                assigned += 1;
            }
            Ok(())
        };
        let mut visitor = WeightVisitorMut::new(&mut assign);
        self.visit_weights_mut(&mut visitor)?;

        if let Some(name) = remaining.keys().next() {
            return Err(Error::UnknownWeight {
                name: name.to_string(),
            });
        }
        if visited > assigned {
            warn!(
                "network '{}': {} of {} weights had no entry and were left untouched",
                self.name,
                visited - assigned,
                visited
            );
        }
        Ok(())
    }

    /// Total element count over Parameter-role weights.
    pub fn count_params(&self) -> Result<usize> {
        let mut total = 0usize;
        let mut count = |_name: &str, role: WeightRole, tensor: &Tensor| -> Result<()> {
            if role == WeightRole::Parameter {
                total += tensor.len();
            }
            Ok(())
        };
        let mut visitor = WeightVisitor::new(&mut count);
        self.visit_weights(&mut visitor)?;
        Ok(total)
    }

    /// Renders a per-layer table of kind, output shape, and parameter count.
    pub fn summary(&self) -> Result<String> {
        let state = self.graph.lock_state();
        let mut out = String::new();
        let rule = "-".repeat(72);
        let _ = writeln!(out, "Network: {}", self.name);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(
            out,
            "{:<24} {:<14} {:<22} {:>8}",
            "layer", "kind", "output shape", "params"
        );
        let _ = writeln!(out, "{rule}");
        let mut total = 0usize;
        for &id in &self.layers {
            let slot = state.layer(id);
            let params = layer_param_count(slot)?;
            total += params;
            let _ = writeln!(
                out,
                "{:<24} {:<14} {:<22} {:>8}",
                slot.name,
                slot.layer.kind(),
                layer_output_column(&state, id),
                params
            );
        }
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "total params: {total}");
        Ok(out)
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Layer for Network {
    fn kind(&self) -> &'static str {
        "network"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> Result<()> {
        Ok(())
    }

    /// Propagates shapes through the inner graph, deepest nodes first.
    fn compute_output_shape(&self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        if input_shapes.len() != self.inputs.len() {
            return Err(Error::InputConstraint {
                layer: self.name.clone(),
                index: 0,
                message: format!(
                    "expects {} inputs, got {}",
                    self.inputs.len(),
                    input_shapes.len()
                ),
            });
        }
        let state = self.graph.lock_state();
        let mut shapes: HashMap<ValueId, Shape> = self
            .inputs
            .iter()
            .zip(input_shapes)
            .map(|(input, shape)| (input.id, shape.clone()))
            .collect();
        for bucket in self.nodes_by_depth.iter().rev() {
            for &node_id in bucket {
                let node = state.node(node_id);
                let node_inputs: Vec<Shape> = node
                    .inputs
                    .iter()
                    .map(|input| {
                        shapes.get(input).cloned().ok_or_else(|| Error::Internal {
                            message: format!(
                                "no shape for '{}' while propagating through '{}'",
                                state.value(*input).name,
                                self.name
                            ),
                        })
                    })
                    .collect::<Result<_>>()?;
                let node_outputs = state
                    .layer(node.layer)
                    .layer
                    .compute_output_shape(&node_inputs)?;
                for (&output, shape) in node.outputs.iter().zip(node_outputs) {
                    shapes.insert(output, shape);
                }
            }
        }
        self.outputs
            .iter()
            .map(|output| {
                shapes.get(&output.id).cloned().ok_or_else(|| Error::Internal {
                    message: format!("output '{}' was not reached", output.name),
                })
            })
            .collect()
    }

    fn output_dtype(&self, _input_dtypes: &[DType], output_index: usize) -> DType {
        self.outputs
            .get(output_index)
            .map(|output| output.dtype())
            .unwrap_or(DType::F32)
    }

    fn forward(&self, inputs: &[Tensor], ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        let feed = self.positional_feed(inputs)?;
        let options = ExecOptions {
            training: ctx.training(),
            trace: None,
        };
        Ok(self.run_with(&feed, &options)?)
    }

    fn input_spec(&self) -> Vec<InputSpec> {
        self.inputs
            .iter()
            .map(|input| {
                let mut spec = InputSpec::exact_rank(input.shape().rank());
                for (axis, dim) in input.shape().dims().iter().enumerate() {
                    if let Dimension::Static(extent) = dim {
                        spec = spec.with_axis(axis as isize, *extent);
                    }
                }
                spec
            })
            .collect()
    }

    fn config(&self) -> Value {
        self.to_config()
            .ok()
            .and_then(|cfg| serde_json::to_value(cfg).ok())
            .unwrap_or(Value::Null)
    }

    fn visit_weights(&self, v: &mut WeightVisitor<'_>) -> Result<()> {
        let state = self.graph.lock_state();
        for &id in &self.layers {
            let slot = state.layer(id);
            v.scoped(&slot.name, |v| slot.layer.visit_weights(v))?;
        }
        Ok(())
    }

    fn visit_weights_mut(&mut self, v: &mut WeightVisitorMut<'_>) -> Result<()> {
        let mut state = self.graph.lock_state();
        for &id in &self.layers {
            let slot = state.layer_mut(id);
            let name = slot.name.clone();
            v.scoped(&name, |v| slot.layer.visit_weights_mut(v))?;
        }
        Ok(())
    }
}

enum Frame {
    Enter(ValueId),
    Exit(ValueId),
}

/// Reverse walk from `fetches` down to producer-less values.
///
/// Returns the visited value set and a node post-order (producers before
/// consumers). Producer-less values outside `input_ids` are rejected.
fn walk_closure(
    state: &GraphState,
    fetches: &[ValueId],
    input_ids: &HashSet<ValueId>,
) -> Result<(HashSet<ValueId>, Vec<NodeId>)> {
    let mut visited: HashSet<ValueId> = HashSet::new();
    let mut expanding: HashSet<ValueId> = HashSet::new();
    let mut seen_nodes: HashSet<NodeId> = HashSet::new();
    let mut node_order: Vec<NodeId> = Vec::new();
    let mut stack: Vec<Frame> = fetches
        .iter()
        .rev()
        .map(|&fetch| Frame::Enter(fetch))
        .collect();

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(value) => {
                if visited.contains(&value) {
                    continue;
                }
                let record = state.value(value);
                let Some(producer) = record.producer else {
                    if !input_ids.contains(&value) {
                        return Err(Error::DisconnectedInput {
                            value: record.name.clone(),
                        });
                    }
                    visited.insert(value);
                    continue;
                };
                if !expanding.insert(value) {
                    let layer = state.layer(state.node(producer.node).layer).name.clone();
                    return Err(Error::CycleDetected { layer });
                }
                stack.push(Frame::Exit(value));
                let node = state.node(producer.node);
                for (slot, &input) in node.inputs.iter().enumerate() {
                    if node.inputs[..slot].contains(&input) {
                        continue;
                    }
                    stack.push(Frame::Enter(input));
                }
            }
            Frame::Exit(value) => {
                expanding.remove(&value);
                visited.insert(value);
                let producer = state.value(value).producer;
                if let Some(producer) = producer {
                    if seen_nodes.insert(producer.node) {
                        node_order.push(producer.node);
                    }
                }
            }
        }
    }

    Ok((visited, node_order))
}

/// Buckets nodes by depth from the outputs: consumers first, each producer
/// at least one deeper than its deepest consumer.
fn group_by_depth(state: &GraphState, node_order: &[NodeId]) -> Vec<Vec<NodeId>> {
    if node_order.is_empty() {
        return Vec::new();
    }
    let mut depths: HashMap<NodeId, usize> = HashMap::new();
    let mut max_depth = 0usize;
    for &node in node_order.iter().rev() {
        let depth = *depths.entry(node).or_insert(0);
        max_depth = max_depth.max(depth);
        for &input in &state.node(node).inputs {
            if let Some(producer) = state.value(input).producer {
                let entry = depths.entry(producer.node).or_insert(depth + 1);
                *entry = (*entry).max(depth + 1);
                max_depth = max_depth.max(*entry);
            }
        }
    }
    let mut buckets = vec![Vec::new(); max_depth + 1];
    for &node in node_order {
        buckets[depths[&node]].push(node);
    }
    buckets
}

fn layer_param_count(slot: &LayerSlot) -> Result<usize> {
    let mut total = 0usize;
    let mut count = |_name: &str, role: WeightRole, tensor: &Tensor| -> Result<()> {
        if role == WeightRole::Parameter {
            total += tensor.len();
        }
        Ok(())
    };
    let mut visitor = WeightVisitor::new(&mut count);
    slot.layer.visit_weights(&mut visitor)?;
    Ok(total)
}

/// Output-shape column for one layer: the shapes of its first invocation,
/// or `multiple` once it has several.
fn layer_output_column(state: &GraphState, layer: LayerId) -> String {
    let mut first: Option<String> = None;
    for node in &state.nodes {
        if node.layer != layer {
            continue;
        }
        if first.is_some() {
            return "multiple".to_string();
        }
        let shapes: Vec<String> = node
            .outputs
            .iter()
            .map(|&output| state.value(output).spec.shape.to_string())
            .collect();
        first = Some(shapes.join(", "));
    }
    first.unwrap_or_else(|| "-".to_string())
}
