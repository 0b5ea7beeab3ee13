use mol_attn::nn::context::{InitContext, Initializer, Lifespan, Regularizer};
use mol_attn::nn::{Layer, MolAttention};
use mol_attn::tensor::Tensor;

fn finalized(k: usize, props: &[&str]) -> (MolAttention<f64>, InitContext) {
    let mut layer = MolAttention::<f64>::new();
    layer.set_property(props).unwrap();
    layer.set_property(&[format!("mol_k={k}").as_str()]).unwrap();
    let mut init = InitContext::new("decoder/attn", vec![[2, 1, 1, 4], [2, 1, 5, 3], [2, 1, 1, k]]);
    layer.finalize(&mut init).unwrap();
    (layer, init)
}

#[test]
fn test_properties_drive_weight_requests() {
    let (layer, init) = finalized(2, &["unit=3", "weight_initializer=ones", "bias_initializer=ones"]);
    let ctx = init.build::<f64>(0);
    let s = layer.slots().unwrap();

    assert_eq!(ctx.weight(s.fc_w).unwrap().data(), &[1.0; 12]);
    assert_eq!(ctx.weight(s.fc_bias).unwrap().data(), &[1.0; 3]);
    assert_eq!(ctx.weight_name(s.fc_proj_w).unwrap(), "decoder/attn:fc_proj_w");
    assert!(ctx.is_trainable(s.fc_w).unwrap());
    for h in s.scratch() {
        assert_eq!(ctx.tensor_lifespan(h).unwrap(), Lifespan::Iteration);
    }
    assert_eq!(init.output_dims(), &[[2, 1, 1, 3]]);
}

#[test]
fn test_default_initializers() {
    let (layer, init) = finalized(4, &["unit=16"]);
    let ctx = init.build::<f64>(99);
    let s = layer.slots().unwrap();

    // Bias defaults to zeros, weights to xavier uniform.
    assert!(ctx.weight(s.fc_bias).unwrap().data().iter().all(|&b| b == 0.0));
    let limit = (6.0f64 / (4.0 + 16.0)).sqrt();
    let fc_w = ctx.weight(s.fc_w).unwrap();
    assert!(fc_w.data().iter().all(|w| w.abs() <= limit));
    assert!(fc_w.data().iter().any(|&w| w != 0.0));
}

#[test]
fn test_l2_regularization_covers_bias() {
    let (mut layer, init) = finalized(2, &[
        "unit=3",
        "bias_initializer=ones",
        "weight_regularizer=l2norm",
        "weight_regularizer_constant=0.1",
    ]);
    let mut ctx = init.build::<f64>(3);
    let s = *layer.slots().unwrap();

    ctx.set_input(s.query, Tensor::full([2, 1, 1, 4], 0.5)).unwrap();
    ctx.set_input(s.value, Tensor::ones([2, 1, 5, 3])).unwrap();
    layer.forward(&mut ctx, true).unwrap();
    ctx.set_incoming_derivative(0, Tensor::ones([2, 1, 1, 3]))
        .unwrap();
    layer.calc_gradient(&mut ctx).unwrap();

    let raw_w = ctx.weight_grad(s.fc_w).unwrap().clone();
    let raw_b = ctx.weight_grad(s.fc_bias).unwrap().clone();
    ctx.apply_regularization();

    let w = ctx.weight(s.fc_w).unwrap();
    let reg_w = ctx.weight_grad(s.fc_w).unwrap();
    for ((g, r), w) in reg_w.data().iter().zip(raw_w.data()).zip(w.data()) {
        assert!((g - (r + 0.1 * w)).abs() < 1e-15);
    }
    let reg_b = ctx.weight_grad(s.fc_bias).unwrap();
    for (g, r) in reg_b.data().iter().zip(raw_b.data()) {
        assert!((g - (r + 0.1)).abs() < 1e-15);
    }

    let expected_loss: f64 = [s.fc_w, s.fc_bias, s.fc_proj_w]
        .iter()
        .map(|&h| 0.05 * ctx.weight(h).unwrap().data().iter().map(|w| w * w).sum::<f64>())
        .sum();
    assert!((ctx.regularization_loss() - expected_loss).abs() < 1e-12);
}

#[test]
fn test_initializer_and_regularizer_names() {
    for init in [
        Initializer::Zeros,
        Initializer::Ones,
        Initializer::XavierUniform,
        Initializer::HeUniform,
        Initializer::LecunUniform,
    ] {
        assert_eq!(init.as_str().parse::<Initializer>().unwrap(), init);
    }
    assert_eq!("none".parse::<Regularizer>().unwrap(), Regularizer::None);
}
