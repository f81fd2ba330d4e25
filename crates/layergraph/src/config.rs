//! Serializable graph descriptions and the layer registry.
//!
//! A [`NetworkConfig`] captures everything needed to rebuild an equivalent
//! network on a fresh arena: declared inputs, layer kind tags with their
//! config payloads, the recorded calls with value references, and the output
//! references. Weights travel separately through
//! [`Network::load_weights`](crate::graph::Network::load_weights).

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::graph::{GraphState, GraphTensor, LayerGraph, LayerId, Network, NodeId, ValueId};
use crate::layer::{CallArgs, Layer};
use crate::layers::{
    Activation, ActivationConfig, Add, Average, Concatenate, ConcatenateConfig, Dense,
    DenseConfig, Dropout, DropoutConfig, Flatten, Multiply,
};
use crate::tensor::{DType, Shape};

/// Complete rebuildable description of one network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub inputs: Vec<InputConfig>,
    pub layers: Vec<LayerNodeConfig>,
    pub outputs: Vec<ValueRef>,
}

/// One declared graph input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
}

/// One registered layer plus its recorded invocations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNodeConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallConfig>,
}

/// One recorded invocation: input references plus call arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    pub inputs: Vec<ValueRef>,
    #[serde(default, skip_serializing_if = "CallArgs::is_empty")]
    pub args: CallArgs,
}

/// Reference to a symbolic value by position rather than id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueRef {
    /// A declared input, by name.
    Input { name: String },
    /// An output slot of one layer invocation.
    Node {
        layer: String,
        call: usize,
        output: usize,
    },
}

/// Factory signature for one layer kind.
///
/// Receives the registry so composite kinds (networks) can rebuild their
/// nested layers.
pub type LayerFactory = fn(&Value, &LayerRegistry) -> Result<Box<dyn Layer>>;

/// Kind-tag dispatch used when rebuilding graphs from descriptions.
pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl LayerRegistry {
    /// A registry with no kinds registered.
    pub fn empty() -> Self {
        LayerRegistry {
            factories: HashMap::new(),
        }
    }

    /// A registry covering every built-in layer kind.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("dense", dense_factory);
        registry.register("activation", activation_factory);
        registry.register("dropout", dropout_factory);
        registry.register("flatten", flatten_factory);
        registry.register("add", add_factory);
        registry.register("multiply", multiply_factory);
        registry.register("average", average_factory);
        registry.register("concatenate", concatenate_factory);
        registry.register("network", network_factory);
        registry
    }

    /// Adds or replaces the factory for one kind tag.
    pub fn register(&mut self, kind: impl Into<String>, factory: LayerFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Instantiates a layer from its kind tag and config payload.
    pub fn build(&self, kind: &str, config: &Value) -> Result<Box<dyn Layer>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::UnknownLayerKind {
                kind: kind.to_string(),
            })?;
        factory(config, self)
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn decode_config<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|source| Error::LayerConfigDecode {
        kind: kind.to_string(),
        source,
    })
}

fn dense_factory(value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    let cfg: DenseConfig = decode_config("dense", value)?;
    Ok(Box::new(Dense::from_config(cfg)?))
}

fn activation_factory(value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    let cfg: ActivationConfig = decode_config("activation", value)?;
    Ok(Box::new(Activation::from_config(cfg)))
}

fn dropout_factory(value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    let cfg: DropoutConfig = decode_config("dropout", value)?;
    Ok(Box::new(Dropout::from_config(cfg)?))
}

fn flatten_factory(_value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Flatten::new()))
}

fn add_factory(_value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Add::new()))
}

fn multiply_factory(_value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Multiply::new()))
}

fn average_factory(_value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Average::new()))
}

fn concatenate_factory(value: &Value, _registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    let cfg: ConcatenateConfig = decode_config("concatenate", value)?;
    Ok(Box::new(Concatenate::from_config(cfg)))
}

fn network_factory(value: &Value, registry: &LayerRegistry) -> Result<Box<dyn Layer>> {
    let cfg: NetworkConfig = decode_config("network", value)?;
    Ok(Box::new(Network::from_config(&cfg, registry)?))
}

impl Network {
    /// Describes the network as a rebuildable config.
    ///
    /// Calls outside the (inputs, outputs) closure are pruned, and the
    /// remaining calls renumbered per layer so references stay consistent
    /// under replay.
    pub fn to_config(&self) -> Result<NetworkConfig> {
        let state = self.graph.lock_state();
        let reachable: HashSet<NodeId> = self
            .nodes_by_depth()
            .iter()
            .flatten()
            .copied()
            .collect();

        let mut call_map: HashMap<(LayerId, usize), usize> = HashMap::new();
        for &layer_id in &self.layers {
            let mut next = 0usize;
            for (index, node) in state.nodes.iter().enumerate() {
                if node.layer != layer_id || !reachable.contains(&NodeId(index as u32)) {
                    continue;
                }
                call_map.insert((layer_id, node.call_index), next);
                next += 1;
            }
        }

        let mut layers = Vec::with_capacity(self.layers.len());
        for &layer_id in &self.layers {
            let slot = state.layer(layer_id);
            let mut calls = Vec::new();
            for (index, node) in state.nodes.iter().enumerate() {
                if node.layer != layer_id || !reachable.contains(&NodeId(index as u32)) {
                    continue;
                }
                let inputs = node
                    .inputs
                    .iter()
                    .map(|&input| describe_value(&state, &call_map, input))
                    .collect::<Result<Vec<_>>>()?;
                calls.push(CallConfig {
                    inputs,
                    args: node.args.clone(),
                });
            }
            layers.push(LayerNodeConfig {
                name: slot.name.clone(),
                kind: slot.layer.kind().to_string(),
                config: slot.layer.config(),
                calls,
            });
        }

        let inputs = self
            .inputs
            .iter()
            .map(|input| InputConfig {
                name: input.name().to_string(),
                shape: input.shape().clone(),
                dtype: input.dtype(),
            })
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|output| describe_value(&state, &call_map, output.id()))
            .collect::<Result<Vec<_>>>()?;

        Ok(NetworkConfig {
            name: self.name.clone(),
            inputs,
            layers,
            outputs,
        })
    }

    /// Rebuilds an equivalent network on a fresh arena by replaying the
    /// described registrations and calls.
    pub fn from_config(config: &NetworkConfig, registry: &LayerRegistry) -> Result<Network> {
        let graph = LayerGraph::new();

        let mut inputs = Vec::with_capacity(config.inputs.len());
        let mut input_table: HashMap<&str, GraphTensor> = HashMap::new();
        for input_cfg in &config.inputs {
            let tensor = graph.input(
                input_cfg.name.clone(),
                input_cfg.shape.clone(),
                input_cfg.dtype,
            )?;
            input_table.insert(input_cfg.name.as_str(), tensor.clone());
            inputs.push(tensor);
        }

        let mut handles = Vec::with_capacity(config.layers.len());
        for layer_cfg in &config.layers {
            let layer = registry.build(&layer_cfg.kind, &layer_cfg.config)?;
            handles.push(graph.register_boxed(layer_cfg.name.clone(), layer)?);
        }

        let call_counts: HashMap<&str, usize> = config
            .layers
            .iter()
            .map(|layer_cfg| (layer_cfg.name.as_str(), layer_cfg.calls.len()))
            .collect();

        // Calls may reference outputs of layers listed later, so sweep until
        // every call has been replayed; each layer's own calls stay in order
        // to keep invocation indices aligned with the description.
        let mut produced: HashMap<(String, usize, usize), GraphTensor> = HashMap::new();
        let mut cursors = vec![0usize; config.layers.len()];
        loop {
            let mut progress = false;
            let mut done = true;
            for (index, layer_cfg) in config.layers.iter().enumerate() {
                while cursors[index] < layer_cfg.calls.len() {
                    let call = &layer_cfg.calls[cursors[index]];
                    let mut resolved = Vec::with_capacity(call.inputs.len());
                    let mut blocked = false;
                    for value_ref in &call.inputs {
                        match resolve_value(value_ref, &input_table, &produced, &call_counts)? {
                            Some(tensor) => resolved.push(tensor),
                            None => {
                                blocked = true;
                                break;
                            }
                        }
                    }
                    if blocked {
                        break;
                    }
                    let refs: Vec<&GraphTensor> = resolved.iter().collect();
                    let outputs = handles[index].apply_with(&refs, call.args.clone())?;
                    for (slot, output) in outputs.into_iter().enumerate() {
                        produced.insert((layer_cfg.name.clone(), cursors[index], slot), output);
                    }
                    cursors[index] += 1;
                    progress = true;
                }
                done &= cursors[index] == layer_cfg.calls.len();
            }
            if done {
                break;
            }
            if !progress {
                let blocked = config
                    .layers
                    .iter()
                    .enumerate()
                    .find(|(index, layer_cfg)| cursors[*index] < layer_cfg.calls.len());
                let message = match blocked {
                    Some((index, layer_cfg)) => format!(
                        "call {} of layer '{}' references values that are never produced",
                        cursors[index], layer_cfg.name
                    ),
                    None => "calls contain unresolvable references".to_string(),
                };
                return Err(Error::InvalidDescription { message });
            }
        }

        let outputs = config
            .outputs
            .iter()
            .map(|value_ref| {
                resolve_value(value_ref, &input_table, &produced, &call_counts)?.ok_or_else(|| {
                    Error::InvalidDescription {
                        message: format!("output reference {value_ref:?} was never produced"),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Network::named(config.name.clone(), &graph, inputs, outputs)
    }
}

fn describe_value(
    state: &GraphState,
    call_map: &HashMap<(LayerId, usize), usize>,
    value: ValueId,
) -> Result<ValueRef> {
    let record = state.value(value);
    match record.producer {
        None => Ok(ValueRef::Input {
            name: record.name.clone(),
        }),
        Some(producer) => {
            let node = state.node(producer.node);
            let call = call_map
                .get(&(node.layer, node.call_index))
                .copied()
                .ok_or_else(|| Error::Internal {
                    message: format!(
                        "value '{}' is produced outside the network closure",
                        record.name
                    ),
                })?;
            Ok(ValueRef::Node {
                layer: state.layer(node.layer).name.clone(),
                call,
                output: producer.index,
            })
        }
    }
}

/// Resolves one reference against the replay state.
///
/// `Ok(None)` means the referenced call exists but has not been replayed
/// yet; structurally impossible references fail immediately.
fn resolve_value(
    value_ref: &ValueRef,
    input_table: &HashMap<&str, GraphTensor>,
    produced: &HashMap<(String, usize, usize), GraphTensor>,
    call_counts: &HashMap<&str, usize>,
) -> Result<Option<GraphTensor>> {
    match value_ref {
        ValueRef::Input { name } => match input_table.get(name.as_str()) {
            Some(tensor) => Ok(Some(tensor.clone())),
            None => Err(Error::InvalidDescription {
                message: format!("reference to unknown input '{name}'"),
            }),
        },
        ValueRef::Node {
            layer,
            call,
            output,
        } => {
            if let Some(tensor) = produced.get(&(layer.clone(), *call, *output)) {
                return Ok(Some(tensor.clone()));
            }
            match call_counts.get(layer.as_str()) {
                Some(&count) if *call < count => Ok(None),
                _ => Err(Error::InvalidDescription {
                    message: format!("reference to undefined call {call} of layer '{layer}'"),
                }),
            }
        }
    }
}
