use anyhow::Result;
use approx::assert_relative_eq;
use layergraph::{
    layers::{
        Activation, ActivationFn, Add, Average, Concatenate, Dense, Dropout, Flatten, Multiply,
    },
    DType, Error, ExecOptions, FeedMap, LayerGraph, Network, Shape, Tensor,
};

fn batch_vec(width: usize) -> Shape {
    Shape::from_dims([None, Some(width)])
}

fn run_single(
    layer: impl layergraph::Layer + 'static,
    shape: Shape,
    payload: Tensor,
) -> Result<Tensor> {
    let graph = LayerGraph::new();
    let x = graph.input("x", shape, DType::F32)?;
    let out = graph.register(layer).call(&[&x])?;
    let network = Network::new(&graph, vec![x], vec![out])?;
    Ok(network.run_on(&[payload])?.remove(0))
}

#[test]
fn dense_rejects_rank_one_and_dynamic_feature_inputs() -> Result<()> {
    let graph = LayerGraph::new();
    let flat = graph.input("flat", Shape::fixed([4]), DType::F32)?;
    let dense = graph.register(Dense::new(2));
    let err = dense
        .call(&[&flat])
        .err()
        .expect("rank-1 input should be rejected");
    assert!(matches!(err, Error::InputConstraint { .. }));

    let ragged = graph.input("ragged", Shape::from_dims([None, None]), DType::F32)?;
    let err = dense
        .call(&[&ragged])
        .err()
        .expect("dynamic feature axis cannot size the kernel");
    assert!(matches!(err, Error::LayerConfig { .. }));
    Ok(())
}

#[test]
fn dense_config_rejects_zero_units() {
    let err = Dense::from_config(layergraph::layers::DenseConfig {
        units: 0,
        use_bias: true,
        activation: ActivationFn::Linear,
        seed: 0,
    })
    .err()
    .expect("zero units should be rejected");
    assert!(matches!(err, Error::LayerConfig { .. }));
}

#[test]
fn activations_apply_elementwise() -> Result<()> {
    let payload = Tensor::from_vec([1, 4], vec![-2.0, -0.5, 0.5, 2.0])?;

    let relu = run_single(
        Activation::new(ActivationFn::Relu),
        batch_vec(4),
        payload.clone(),
    )?;
    assert_eq!(relu.as_f32()?, &[0.0, 0.0, 0.5, 2.0]);

    let tanh = run_single(
        Activation::new(ActivationFn::Tanh),
        batch_vec(4),
        payload.clone(),
    )?;
    for (out, &input) in tanh.as_f32()?.iter().zip(payload.as_f32()?) {
        assert_relative_eq!(*out, input.tanh());
    }

    let sigmoid = run_single(Activation::new(ActivationFn::Sigmoid), batch_vec(4), payload)?;
    for &value in sigmoid.as_f32()? {
        assert!(value > 0.0 && value < 1.0);
    }
    Ok(())
}

#[test]
fn softmax_rows_sum_to_one() -> Result<()> {
    let payload = Tensor::from_vec([2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0])?;
    let out = run_single(Activation::new(ActivationFn::Softmax), batch_vec(3), payload)?;
    for row in out.as_f32()?.chunks(3) {
        assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(row.windows(2).all(|pair| pair[0] < pair[1]));
    }
    Ok(())
}

#[test]
fn dropout_is_identity_outside_training() -> Result<()> {
    let payload = Tensor::from_vec([1, 8], (1..=8).map(|v| v as f32).collect())?;
    let out = run_single(Dropout::new(0.5)?, batch_vec(8), payload.clone())?;
    assert_eq!(out.as_f32()?, payload.as_f32()?);
    Ok(())
}

#[test]
fn dropout_masks_and_rescales_in_training() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", batch_vec(64), DType::F32)?;
    let out = graph
        .register(Dropout::new(0.5)?.with_seed(42))
        .call(&[&x])?;

    let mut feed = FeedMap::new();
    feed.insert(&x, Tensor::ones([1, 64]))?;
    let options = ExecOptions {
        training: true,
        trace: None,
    };
    let results = graph.execute(&[&out], &feed, &options)?;

    let values = results[0].as_f32()?;
    let zeros = values.iter().filter(|&&v| v == 0.0).count();
    assert!(zeros > 0, "some elements should be dropped");
    assert!(zeros < 64, "some elements should survive");
    for &value in values {
        assert!(value == 0.0 || (value - 2.0).abs() < 1e-6);
    }

    // Seeded masking is reproducible call to call.
    let again = graph.execute(&[&out], &feed, &options)?;
    assert_eq!(again[0].as_f32()?, values);
    Ok(())
}

#[test]
fn dropout_rejects_rates_outside_the_unit_interval() {
    assert!(matches!(Dropout::new(1.0), Err(Error::LayerConfig { .. })));
    assert!(matches!(Dropout::new(-0.1), Err(Error::LayerConfig { .. })));
}

#[test]
fn flatten_collapses_trailing_axes() -> Result<()> {
    let payload = Tensor::from_vec([2, 3, 2], (0..12).map(|v| v as f32).collect())?;
    let out = run_single(
        Flatten::new(),
        Shape::from_dims([None, Some(3), Some(2)]),
        payload.clone(),
    )?;
    assert_eq!(out.dims(), &[2, 6]);
    assert_eq!(out.as_f32()?, payload.as_f32()?);
    Ok(())
}

#[test]
fn merge_layers_combine_elementwise() -> Result<()> {
    let graph = LayerGraph::new();
    let a = graph.input("a", batch_vec(3), DType::F32)?;
    let b = graph.input("b", batch_vec(3), DType::F32)?;
    let sum = graph.register(Add::new()).call(&[&a, &b])?;
    let product = graph.register(Multiply::new()).call(&[&a, &b])?;
    let mean = graph.register(Average::new()).call(&[&a, &b])?;

    let mut feed = FeedMap::new();
    feed.insert(&a, Tensor::from_vec([1, 3], vec![1.0, 2.0, 3.0])?)?;
    feed.insert(&b, Tensor::from_vec([1, 3], vec![4.0, 5.0, 6.0])?)?;
    let results = graph.execute(&[&sum, &product, &mean], &feed, &ExecOptions::default())?;

    assert_eq!(results[0].as_f32()?, &[5.0, 7.0, 9.0]);
    assert_eq!(results[1].as_f32()?, &[4.0, 10.0, 18.0]);
    assert_eq!(results[2].as_f32()?, &[2.5, 3.5, 4.5]);
    Ok(())
}

#[test]
fn merge_layers_need_compatible_shapes() -> Result<()> {
    let graph = LayerGraph::new();
    let a = graph.input("a", batch_vec(3), DType::F32)?;
    let b = graph.input("b", batch_vec(4), DType::F32)?;
    // Shape errors surface under the registered name, not the kind tag.
    let err = graph
        .register_named("combine", Add::new())?
        .call(&[&a, &b])
        .err()
        .expect("mismatched widths should be rejected");
    assert!(matches!(err, Error::LayerConfig { layer, .. } if layer == "combine"));

    let err = graph
        .register_named("scale_by", Multiply::new())?
        .call(&[&a])
        .err()
        .expect("a single input is not a merge");
    assert!(matches!(err, Error::LayerConfig { layer, .. } if layer == "scale_by"));
    Ok(())
}

#[test]
fn concatenate_joins_along_the_requested_axis() -> Result<()> {
    let graph = LayerGraph::new();
    let a = graph.input("a", Shape::fixed([2, 2]), DType::F32)?;
    let b = graph.input("b", Shape::fixed([2, 3]), DType::F32)?;
    let joined = graph.register(Concatenate::new(-1)).call(&[&a, &b])?;
    assert_eq!(joined.shape(), &Shape::fixed([2, 5]));

    let mut feed = FeedMap::new();
    feed.insert(&a, Tensor::from_vec([2, 2], vec![1.0, 2.0, 5.0, 6.0])?)?;
    feed.insert(
        &b,
        Tensor::from_vec([2, 3], vec![3.0, 4.0, 0.0, 7.0, 8.0, 9.0])?,
    )?;
    let results = graph.execute(&[&joined], &feed, &ExecOptions::default())?;
    assert_eq!(
        results[0].as_f32()?,
        &[1.0, 2.0, 3.0, 4.0, 0.0, 5.0, 6.0, 7.0, 8.0, 9.0]
    );
    Ok(())
}

#[test]
fn concatenate_requires_agreement_off_axis() -> Result<()> {
    let graph = LayerGraph::new();
    let a = graph.input("a", Shape::fixed([2, 2]), DType::F32)?;
    let b = graph.input("b", Shape::fixed([3, 2]), DType::F32)?;
    let err = graph
        .register(Concatenate::new(-1))
        .call(&[&a, &b])
        .err()
        .expect("off-axis disagreement should be rejected");
    assert!(matches!(err, Error::LayerConfig { .. }));
    Ok(())
}

#[test]
fn dense_builds_once_and_pins_its_feature_axis() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", batch_vec(4), DType::F32)?;
    let dense = graph.register_named("proj", Dense::new(2))?;
    assert!(!dense.built());
    dense.call(&[&x])?;
    assert!(dense.built());

    let narrow = graph.input("narrow", batch_vec(3), DType::F32)?;
    let err = dense
        .call(&[&narrow])
        .err()
        .expect("width change after build should be rejected");
    assert!(matches!(err, Error::InputConstraint { layer, .. } if layer == "proj"));
    Ok(())
}
