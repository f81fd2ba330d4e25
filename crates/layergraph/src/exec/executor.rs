//! Topological evaluation with reference-counted early release.
//!
//! Execution is two phases over the arena: a reverse depth-first walk from
//! the fetch targets that stops at fed values and yields a post-order plan
//! with recipient counts, then a forward pass that evaluates each producing
//! node exactly once and drops intermediates as their counts hit zero.

use anyhow::anyhow;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::graph::{GraphState, LayerGraph, ValueId};
use crate::layer::CallContext;
use crate::tensor::Tensor;

use super::feed::FeedMap;
use super::plan::{ExecPlan, PlanKey};
use super::trace::{NodeContext, NodeStats, NodeStatus, RunStats};
use super::ExecOptions;

/// Evaluates `fetches` against `feed`, returning tensors in the caller's
/// order and multiplicity.
pub(crate) fn execute(
    graph: &LayerGraph,
    fetches: &[ValueId],
    feed: &FeedMap,
    options: &ExecOptions,
) -> Result<Vec<Tensor>> {
    let run_started = Instant::now();
    let state = graph.lock_state();

    let key = PlanKey::new(fetches, feed.ids());
    let cached = graph.lock_plans().get(&key, state.version);
    let plan_cached = cached.is_some();
    let plan = match cached {
        Some(plan) => plan,
        None => {
            let plan = Arc::new(build_plan(&state, fetches, feed)?);
            graph.lock_plans().insert(key, Arc::clone(&plan));
            plan
        }
    };

    let mut working: HashMap<ValueId, Tensor> = feed
        .entries()
        .map(|(id, tensor)| (id, tensor.clone()))
        .collect();
    let mut counts = plan.recipients.clone();
    let fetch_set: HashSet<ValueId> = fetches.iter().copied().collect();
    let mut stats = RunStats {
        plan_cached,
        ..RunStats::default()
    };

    for &value in &plan.order {
        if !working.contains_key(&value) {
            evaluate_producer(&state, value, &mut working, options, &mut stats)?;
        }
        let Some(producer) = state.value(value).producer else {
            return Err(Error::Internal {
                message: format!("ordered value {value:?} has no producer"),
            });
        };
        let node = state.node(producer.node);
        for (slot, &input) in node.inputs.iter().enumerate() {
            if node.inputs[..slot].contains(&input) {
                continue;
            }
            let Some(count) = counts.get_mut(&input) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0
                && !options.training
                && !fetch_set.contains(&input)
                && !feed.contains_id(input)
                && working.remove(&input).is_some()
            {
                stats.values_released += 1;
                debug!("released '{}' after its last consumer", state.value(input).name);
            }
        }
    }

    let mut results = Vec::with_capacity(fetches.len());
    for &fetch in fetches {
        let tensor = working.get(&fetch).cloned().ok_or_else(|| Error::Internal {
            message: format!("fetch '{}' was not materialized", state.value(fetch).name),
        })?;
        results.push(tensor);
    }

    stats.duration = run_started.elapsed();
    if let Some(sink) = &options.trace {
        sink.after_run(&stats);
    }
    Ok(results)
}

/// Runs the producing node of `value`, storing every output that is not
/// already present in the working set.
fn evaluate_producer(
    state: &GraphState,
    value: ValueId,
    working: &mut HashMap<ValueId, Tensor>,
    options: &ExecOptions,
    stats: &mut RunStats,
) -> Result<()> {
    let Some(producer) = state.value(value).producer else {
        return Err(Error::MissingFeed {
            value: state.value(value).name.clone(),
        });
    };
    let node = state.node(producer.node);
    let slot = state.layer(node.layer);

    let mut inputs = Vec::with_capacity(node.inputs.len());
    for &input in &node.inputs {
        let tensor = working.get(&input).cloned().ok_or_else(|| Error::Internal {
            message: format!(
                "input '{}' not materialized before '{}'",
                state.value(input).name,
                state.value(value).name
            ),
        })?;
        inputs.push(tensor);
    }

    let training = node.args.training.unwrap_or(options.training);
    let ctx = CallContext::new(training, &node.args);
    let trace_ctx = options.trace.as_ref().map(|_| NodeContext {
        node: producer.node,
        layer: slot.name.clone(),
        inputs: node.inputs.to_vec(),
        outputs: node.outputs.to_vec(),
    });
    if let (Some(sink), Some(trace_ctx)) = (&options.trace, &trace_ctx) {
        sink.before_node(trace_ctx);
    }

    let started = Instant::now();
    let result = slot.layer.forward(&inputs, &ctx);
    let node_stats = NodeStats {
        duration: started.elapsed(),
    };

    let outputs = match result {
        Ok(outputs) => {
            if let (Some(sink), Some(trace_ctx)) = (&options.trace, &trace_ctx) {
                sink.after_node(trace_ctx, &node_stats, &NodeStatus::Success);
            }
            outputs
        }
        Err(source) => {
            if let (Some(sink), Some(trace_ctx)) = (&options.trace, &trace_ctx) {
                sink.after_node(
                    trace_ctx,
                    &node_stats,
                    &NodeStatus::Failure {
                        message: source.to_string(),
                    },
                );
            }
            return Err(Error::LayerInvocation {
                layer: slot.name.clone(),
                node: producer.node,
                source,
            });
        }
    };

    if outputs.len() != node.outputs.len() {
        return Err(Error::LayerInvocation {
            layer: slot.name.clone(),
            node: producer.node,
            source: anyhow!(
                "forward returned {} outputs, expected {}",
                outputs.len(),
                node.outputs.len()
            ),
        });
    }
    stats.nodes_evaluated += 1;
    for (&id, tensor) in node.outputs.iter().zip(outputs) {
        working.entry(id).or_insert(tensor);
    }
    Ok(())
}

enum Frame {
    Enter(ValueId),
    Exit(ValueId),
}

/// Reverse reachability from the fetches, stopping at fed values.
///
/// Produces a post-order over producible values and counts, per value, the
/// distinct downstream values whose production consumes it. A value
/// re-entered while its own expansion is still open is a cycle.
fn build_plan(state: &GraphState, fetches: &[ValueId], feed: &FeedMap) -> Result<ExecPlan> {
    let mut order = Vec::new();
    let mut recipients: HashMap<ValueId, usize> = HashMap::new();
    let mut visited: HashSet<ValueId> = HashSet::new();
    let mut expanding: HashSet<ValueId> = HashSet::new();
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
                if feed.contains_id(value) {
                    visited.insert(value);
                    continue;
                }
                let record = state.value(value);
                let Some(producer) = record.producer else {
                    return Err(Error::MissingFeed {
                        value: record.name.clone(),
                    });
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
                    *recipients.entry(input).or_insert(0) += 1;
                    stack.push(Frame::Enter(input));
                }
            }
            Frame::Exit(value) => {
                expanding.remove(&value);
                visited.insert(value);
                order.push(value);
            }
        }
    }

    Ok(ExecPlan {
        order,
        recipients,
        version: state.version,
    })
}
