use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use layergraph::{
    CallArgs, CallContext, DType, Error, ExecOptions, FeedMap, Layer, LayerGraph, RunStats,
    Shape, Tensor, TraceSink,
};

/// Identity layer counting its forward invocations.
#[derive(Debug)]
struct Counted {
    calls: Arc<AtomicUsize>,
}

impl Counted {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Counted {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Layer for Counted {
    fn kind(&self) -> &'static str {
        "counted"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> layergraph::Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> layergraph::Result<Vec<Shape>> {
        Ok(vec![input_shapes[0].clone()])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![inputs[0].clone()])
    }
}

/// Two-input elementwise sum counting its forward invocations.
#[derive(Debug)]
struct CountedSum {
    calls: Arc<AtomicUsize>,
}

impl CountedSum {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            CountedSum {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Layer for CountedSum {
    fn kind(&self) -> &'static str {
        "counted_sum"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> layergraph::Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> layergraph::Result<Vec<Shape>> {
        Ok(vec![input_shapes[0].clone()])
    }

    fn forward(&self, inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![inputs[0].zip_map(&inputs[1], |a, b| a + b)?])
    }
}

/// Layer whose forward always fails.
#[derive(Debug)]
struct Exploding;

impl Layer for Exploding {
    fn kind(&self) -> &'static str {
        "exploding"
    }

    fn built(&self) -> bool {
        true
    }

    fn build(&mut self, _input_shapes: &[Shape]) -> layergraph::Result<()> {
        Ok(())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> layergraph::Result<Vec<Shape>> {
        Ok(vec![input_shapes[0].clone()])
    }

    fn forward(&self, _inputs: &[Tensor], _ctx: &CallContext<'_>) -> anyhow::Result<Vec<Tensor>> {
        bail!("numerical meltdown")
    }
}

/// Records layer names in evaluation order and keeps the final run summary.
#[derive(Default)]
struct Recorder {
    order: Mutex<Vec<String>>,
    stats: Mutex<Option<RunStats>>,
}

impl TraceSink for Recorder {
    fn before_node(&self, ctx: &layergraph::NodeContext) {
        self.order.lock().unwrap().push(ctx.layer.clone());
    }

    fn after_run(&self, stats: &RunStats) {
        *self.stats.lock().unwrap() = Some(stats.clone());
    }
}

fn vec_shape(width: usize) -> Shape {
    Shape::fixed([1, width])
}

fn tensor(values: &[f32]) -> Tensor {
    Tensor::from_vec([1, values.len()], values.to_vec()).unwrap()
}

#[test]
fn chain_round_trips_and_reuses_nodes_across_duplicate_fetches() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(3), DType::F32)?;
    let (layer_a, calls_a) = Counted::new();
    let (layer_b, calls_b) = Counted::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    let b = graph.register_named("b", layer_b)?.call(&[&a])?;

    let payload = tensor(&[1.0, -2.5, 4.0]);
    let mut feed = FeedMap::new();
    feed.insert(&x, payload.clone())?;

    // B fetched three times still means one evaluation of each node.
    let results = graph.execute(&[&b, &b, &b], &feed, &ExecOptions::default())?;
    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.as_f32()?, payload.as_f32()?);
    }
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn diamond_evaluates_each_branch_once() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer_a, calls_a) = Counted::new();
    let (layer_b, calls_b) = Counted::new();
    let (layer_c, calls_c) = CountedSum::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    let b = graph.register_named("b", layer_b)?.call(&[&x])?;
    let c = graph.register_named("c", layer_c)?.call(&[&a, &b])?;

    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 2.0]))?;
    let results = graph.execute(&[&c], &feed, &ExecOptions::default())?;

    assert_eq!(results[0].as_f32()?, &[2.0, 4.0]);
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert_eq!(calls_c.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn shared_ancestor_runs_once_for_multiple_fetches() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (root, root_calls) = Counted::new();
    let (left, _) = Counted::new();
    let (right, _) = Counted::new();
    let shared = graph.register_named("root", root)?.call(&[&x])?;
    let l = graph.register_named("left", left)?.call(&[&shared])?;
    let r = graph.register_named("right", right)?.call(&[&shared])?;

    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[0.5, 0.5]))?;
    graph.execute(&[&l, &r], &feed, &ExecOptions::default())?;

    assert_eq!(root_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn feeding_an_intermediate_suppresses_its_producer() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer_a, calls_a) = Counted::new();
    let (layer_b, calls_b) = Counted::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    let b = graph.register_named("b", layer_b)?.call(&[&a])?;

    // Feeding "a" directly makes it a leaf; its producer must not run, and
    // the graph input is no longer required at all.
    let mut feed = FeedMap::new();
    feed.insert(&a, tensor(&[7.0, 8.0]))?;
    let results = graph.execute(&[&b], &feed, &ExecOptions::default())?;

    assert_eq!(results[0].as_f32()?, &[7.0, 8.0]);
    assert_eq!(calls_a.load(Ordering::SeqCst), 0);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn feeding_one_sibling_output_survives_the_producer_run() -> Result<()> {
    /// Emits two copies of its input, counting invocations.
    #[derive(Debug)]
    struct Fork {
        calls: Arc<AtomicUsize>,
    }

    impl Layer for Fork {
        fn kind(&self) -> &'static str {
            "fork"
        }

        fn built(&self) -> bool {
            true
        }

        fn build(&mut self, _input_shapes: &[Shape]) -> layergraph::Result<()> {
            Ok(())
        }

        fn compute_output_shape(&self, input_shapes: &[Shape]) -> layergraph::Result<Vec<Shape>> {
            Ok(vec![input_shapes[0].clone(), input_shapes[0].clone()])
        }

        fn forward(
            &self,
            inputs: &[Tensor],
            _ctx: &CallContext<'_>,
        ) -> anyhow::Result<Vec<Tensor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![inputs[0].clone(), inputs[0].clone()])
        }
    }

    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pair = graph
        .register_named(
            "fork",
            Fork {
                calls: Arc::clone(&calls),
            },
        )?
        .apply(&[&x])?;

    // The second slot is fed directly; fetching both slots still runs the
    // producer for the first, but its recomputed sibling must not clobber
    // the fed tensor.
    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 2.0]))?;
    feed.insert(&pair[1], tensor(&[-9.0, -9.0]))?;
    let results = graph.execute(&[&pair[0], &pair[1]], &feed, &ExecOptions::default())?;

    assert_eq!(results[0].as_f32()?, &[1.0, 2.0]);
    assert_eq!(results[1].as_f32()?, &[-9.0, -9.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn duplicate_input_slots_count_one_recipient() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer_a, calls_a) = Counted::new();
    let (doubler, _) = CountedSum::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    // The same value on both input slots must be counted (and released)
    // once, not twice.
    let doubled = graph.register_named("double", doubler)?.call(&[&a, &a])?;

    let recorder = Arc::new(Recorder::default());
    let options = ExecOptions {
        training: false,
        trace: Some(recorder.clone()),
    };
    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.5, -2.0]))?;
    let results = graph.execute(&[&doubled], &feed, &options)?;

    assert_eq!(results[0].as_f32()?, &[3.0, -4.0]);
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    let stats = recorder.stats.lock().unwrap().clone().expect("run summary");
    // Only the intermediate is transient; the fed input and the fetch stay.
    assert_eq!(stats.values_released, 1);
    Ok(())
}

#[test]
fn missing_feed_names_the_ungiven_input() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("pixels", vec_shape(2), DType::F32)?;
    let (layer, _) = Counted::new();
    let out = graph.register_named("a", layer)?.call(&[&x])?;

    let err = graph
        .execute(&[&out], &FeedMap::new(), &ExecOptions::default())
        .err()
        .expect("empty feed should fail");
    assert!(matches!(err, Error::MissingFeed { value } if value == "pixels"));
    Ok(())
}

#[test]
fn fetching_a_fed_input_returns_it_unchanged() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;

    let payload = tensor(&[3.0, 1.0]);
    let mut feed = FeedMap::new();
    feed.insert(&x, payload.clone())?;
    let results = graph.execute(&[&x], &feed, &ExecOptions::default())?;
    assert_eq!(results[0].as_f32()?, payload.as_f32()?);
    Ok(())
}

#[test]
fn trace_observes_topological_order_and_release_counts() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer_a, _) = Counted::new();
    let (layer_b, _) = Counted::new();
    let (layer_c, _) = Counted::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    let b = graph.register_named("b", layer_b)?.call(&[&a])?;
    let c = graph.register_named("c", layer_c)?.call(&[&b])?;

    let recorder = Arc::new(Recorder::default());
    let options = ExecOptions {
        training: false,
        trace: Some(recorder.clone()),
    };
    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 1.0]))?;
    graph.execute(&[&c], &feed, &options)?;

    assert_eq!(*recorder.order.lock().unwrap(), vec!["a", "b", "c"]);
    let stats = recorder.stats.lock().unwrap().clone().expect("run summary");
    assert_eq!(stats.nodes_evaluated, 3);
    // "a" and "b" are transient; the fed input and the fetch survive.
    assert_eq!(stats.values_released, 2);
    assert!(!stats.plan_cached);
    Ok(())
}

#[test]
fn training_mode_retains_every_intermediate() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer_a, _) = Counted::new();
    let (layer_b, _) = Counted::new();
    let a = graph.register_named("a", layer_a)?.call(&[&x])?;
    let b = graph.register_named("b", layer_b)?.call(&[&a])?;

    let recorder = Arc::new(Recorder::default());
    let options = ExecOptions {
        training: true,
        trace: Some(recorder.clone()),
    };
    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 1.0]))?;
    graph.execute(&[&b], &feed, &options)?;

    let stats = recorder.stats.lock().unwrap().clone().expect("run summary");
    assert_eq!(stats.values_released, 0);
    Ok(())
}

#[test]
fn repeated_runs_hit_the_plan_cache() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let (layer, _) = Counted::new();
    let out = graph.register_named("a", layer)?.call(&[&x])?;

    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 2.0]))?;
    let recorder = Arc::new(Recorder::default());
    let options = ExecOptions {
        training: false,
        trace: Some(recorder.clone()),
    };

    graph.execute(&[&out], &feed, &options)?;
    assert!(!recorder.stats.lock().unwrap().clone().unwrap().plan_cached);

    graph.execute(&[&out], &feed, &options)?;
    assert!(recorder.stats.lock().unwrap().clone().unwrap().plan_cached);
    assert_eq!(graph.plan_count(), 1);

    // Recording a new node invalidates the cached order.
    let (layer_b, _) = Counted::new();
    graph.register_named("b", layer_b)?.call(&[&out])?;
    graph.execute(&[&out], &feed, &options)?;
    assert!(!recorder.stats.lock().unwrap().clone().unwrap().plan_cached);
    Ok(())
}

#[test]
fn forward_failures_carry_the_layer_identity() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(2), DType::F32)?;
    let out = graph.register_named("boom", Exploding)?.call(&[&x])?;

    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[1.0, 2.0]))?;
    let err = graph
        .execute(&[&out], &feed, &ExecOptions::default())
        .err()
        .expect("forward failure should propagate");
    match err {
        Error::LayerInvocation { layer, source, .. } => {
            assert_eq!(layer, "boom");
            assert!(source.to_string().contains("numerical meltdown"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn per_node_training_override_beats_the_execute_flag() -> Result<()> {
    /// Emits 1.0 when its resolved training flag is set, else 0.0.
    #[derive(Debug)]
    struct Mode;

    impl Layer for Mode {
        fn kind(&self) -> &'static str {
            "mode"
        }

        fn built(&self) -> bool {
            true
        }

        fn build(&mut self, _input_shapes: &[Shape]) -> layergraph::Result<()> {
            Ok(())
        }

        fn compute_output_shape(&self, input_shapes: &[Shape]) -> layergraph::Result<Vec<Shape>> {
            Ok(vec![input_shapes[0].clone()])
        }

        fn forward(
            &self,
            inputs: &[Tensor],
            ctx: &CallContext<'_>,
        ) -> anyhow::Result<Vec<Tensor>> {
            let flag = if ctx.training() { 1.0 } else { 0.0 };
            Ok(vec![inputs[0].map(|_| flag)?])
        }
    }

    let graph = LayerGraph::new();
    let x = graph.input("x", vec_shape(1), DType::F32)?;
    let mode = graph.register(Mode);
    let inherited = mode.call(&[&x])?;
    let pinned = mode.apply_with(&[&x], CallArgs::training(true))?;

    let mut feed = FeedMap::new();
    feed.insert(&x, tensor(&[0.0]))?;
    let results = graph.execute(&[&inherited, &pinned[0]], &feed, &ExecOptions::default())?;

    assert_eq!(results[0].as_f32()?, &[0.0]);
    assert_eq!(results[1].as_f32()?, &[1.0]);
    Ok(())
}
