use anyhow::Result;
use approx::assert_relative_eq;
use layergraph::{
    layers::{Activation, ActivationFn, Add, Dense},
    DType, Dimension, Layer, LayerGraph, Network, Shape, Tensor,
};

fn batch_vec(width: usize) -> Shape {
    Shape::from_dims([None, Some(width)])
}

/// Dense 4 -> 3 -> 2 stack with seeded weights.
fn small_network() -> Result<Network> {
    let graph = LayerGraph::new();
    let x = graph.input("x", batch_vec(4), DType::F32)?;
    let hidden = graph
        .register_named(
            "hidden",
            Dense::new(3).with_seed(7).with_activation(ActivationFn::Relu),
        )?
        .call(&[&x])?;
    let logits = graph
        .register_named("logits", Dense::new(2).with_seed(11))?
        .call(&[&hidden])?;
    Ok(Network::named("mlp", &graph, vec![x], vec![logits])?)
}

#[test]
fn run_on_matches_inputs_positionally() -> Result<()> {
    let network = small_network()?;
    let results = network.run_on(&[Tensor::zeros([2, 4])])?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dims(), &[2, 2]);

    // Zero input through relu then an affine map lands on the bias, which
    // initializes to zero.
    for &value in results[0].as_f32()? {
        assert_relative_eq!(value, 0.0);
    }
    Ok(())
}

#[test]
fn run_on_checks_input_arity() -> Result<()> {
    let network = small_network()?;
    let err = network
        .run_on(&[Tensor::zeros([2, 4]), Tensor::zeros([2, 4])])
        .err()
        .expect("surplus inputs should be rejected");
    assert!(err.to_string().contains("expects 1 inputs"));
    Ok(())
}

#[test]
fn count_params_sums_kernels_and_biases() -> Result<()> {
    let network = small_network()?;
    // 4*3 + 3 + 3*2 + 2
    assert_eq!(network.count_params()?, 23);
    Ok(())
}

#[test]
fn summary_lists_each_layer_with_its_shape() -> Result<()> {
    let network = small_network()?;
    let summary = network.summary()?;
    assert!(summary.contains("Network: mlp"));
    assert!(summary.contains("hidden"));
    assert!(summary.contains("dense"));
    assert!(summary.contains("[?, 3]"));
    assert!(summary.contains("total params: 23"));
    Ok(())
}

#[test]
fn network_shape_propagation_resolves_the_batch_axis() -> Result<()> {
    let network = small_network()?;
    let shapes = network.compute_output_shape(&[Shape::fixed([8, 4])])?;
    assert_eq!(shapes, vec![Shape::fixed([8, 2])]);

    // A dynamic batch stays dynamic through the stack.
    let shapes = network.compute_output_shape(&[batch_vec(4)])?;
    assert_eq!(shapes[0].dims()[0], Dimension::Dynamic);
    assert_eq!(shapes[0].dims()[1], Dimension::Static(2));
    Ok(())
}

#[test]
fn network_nests_as_a_layer_in_another_graph() -> Result<()> {
    let inner = small_network()?;

    let outer = LayerGraph::new();
    let x = outer.input("x", batch_vec(4), DType::F32)?;
    let encoder = outer.register_named("encoder", inner)?;
    let encoded = encoder.call(&[&x])?;
    assert_eq!(encoded.shape(), &batch_vec(2));

    let squashed = outer
        .register(Activation::new(ActivationFn::Sigmoid))
        .call(&[&encoded])?;
    let model = Network::named("wrapper", &outer, vec![x], vec![squashed])?;

    let results = model.run_on(&[Tensor::zeros([3, 4])])?;
    assert_eq!(results[0].dims(), &[3, 2]);
    // sigmoid(0) = 0.5 for the all-zero batch.
    for &value in results[0].as_f32()? {
        assert_relative_eq!(value, 0.5);
    }
    Ok(())
}

#[test]
fn nested_network_exposes_scoped_weights() -> Result<()> {
    let inner = small_network()?;

    let outer = LayerGraph::new();
    let x = outer.input("x", batch_vec(4), DType::F32)?;
    let encoded = outer.register_named("encoder", inner)?.call(&[&x])?;
    let model = Network::named("wrapper", &outer, vec![x], vec![encoded])?;

    let specs = model.weight_specs()?;
    let names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "encoder.hidden.kernel",
            "encoder.hidden.bias",
            "encoder.logits.kernel",
            "encoder.logits.bias",
        ]
    );
    assert_eq!(model.count_params()?, 23);
    Ok(())
}

#[test]
fn shared_layer_appears_once_in_the_network() -> Result<()> {
    let graph = LayerGraph::new();
    let x = graph.input("x", batch_vec(4), DType::F32)?;
    let y = graph.input("y", batch_vec(4), DType::F32)?;
    let proj = graph.register_named("proj", Dense::new(4).with_seed(3))?;
    let a = proj.call(&[&x])?;
    let b = proj.call(&[&y])?;
    let merged = graph.register(Add::new()).call(&[&a, &b])?;

    let network = Network::new(&graph, vec![x, y], vec![merged])?;
    let handles = network.layer_handles();
    let projections = handles
        .iter()
        .filter(|handle| handle.name() == "proj")
        .count();
    assert_eq!(projections, 1);
    // One kernel and one bias even though the layer ran at two positions.
    assert_eq!(network.weight_specs()?.len(), 2);
    Ok(())
}
