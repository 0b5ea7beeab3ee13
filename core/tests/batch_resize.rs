use mol_attn::nn::context::InitContext;
use mol_attn::nn::{Layer, LayerError, MolAttention, MolAttentionProps};
use mol_attn::tensor::Tensor;

#[test]
fn test_resize_one_to_four() {
    let (k, len, unit) = (2, 5, 8);
    let mut layer = MolAttention::<f32>::with_props(
        MolAttentionProps::default()
            .with_unit(unit)
            .with_mol_k(k),
    );
    let mut init = InitContext::new("attn", vec![[1, 1, 1, 4], [1, 1, len, 3], [1, 1, 1, k]]);
    layer.finalize(&mut init).unwrap();
    let mut ctx = init.build::<f32>(9);
    let s = *layer.slots().unwrap();

    let before: Vec<[usize; 4]> = s
        .scratch()
        .iter()
        .map(|&h| *ctx.tensor(h).unwrap().shape())
        .collect();
    assert!(before.iter().all(|d| d[0] == 1));

    layer.set_batch(&mut ctx, 4).unwrap();

    for (h, old) in s.scratch().iter().zip(&before) {
        let new = ctx.tensor(*h).unwrap().shape();
        assert_eq!(new[0], 4, "{}", ctx.tensor_name(*h).unwrap());
        assert_eq!(new[1..], old[1..], "{}", ctx.tensor_name(*h).unwrap());
    }
    assert_eq!(ctx.tensor_grad(s.fc_proj_out).unwrap().shape(), &[4, 1, 1, 3 * k]);
    assert_eq!(ctx.tensor(s.prob).unwrap().shape(), &[4, 1, len, k]);
    // Weights do not depend on the batch.
    assert_eq!(ctx.weight(s.fc_w).unwrap().shape(), &[1, 1, 4, unit]);

    // The resized layer needs a fresh forward before any backward.
    assert!(matches!(
        layer.calc_derivative(&mut ctx),
        Err(LayerError::ForwardNotRun)
    ));

    ctx.set_input(s.query, Tensor::ones([4, 1, 1, 4])).unwrap();
    ctx.set_input(s.value, Tensor::ones([4, 1, len, 3])).unwrap();
    ctx.set_input(s.state, Tensor::zeros([4, 1, 1, k])).unwrap();
    layer.forward(&mut ctx, true).unwrap();
    assert_eq!(ctx.output(0).unwrap().shape(), &[4, 1, 1, 3]);

    ctx.set_incoming_derivative(0, Tensor::ones([4, 1, 1, 3]))
        .unwrap();
    layer.calc_gradient(&mut ctx).unwrap();
    layer.calc_derivative(&mut ctx).unwrap();
    assert_eq!(ctx.outgoing_derivative(s.value).unwrap().shape(), &[4, 1, len, 3]);
    assert_eq!(ctx.weight_grad(s.fc_proj_w).unwrap().shape(), &[1, 1, unit, 3 * k]);
}

#[test]
fn test_stale_batch_inputs_are_rejected() {
    let mut layer = MolAttention::<f32>::with_props(MolAttentionProps::default().with_unit(4).with_mol_k(2));
    let mut init = InitContext::new("attn", vec![[1, 1, 1, 4], [1, 1, 5, 3], [1, 1, 1, 2]]);
    layer.finalize(&mut init).unwrap();
    let mut ctx = init.build::<f32>(0);

    layer.set_batch(&mut ctx, 4).unwrap();
    // Inputs still hold batch 1, which no longer fits the scratch buffers.
    assert!(matches!(
        layer.forward(&mut ctx, true),
        Err(LayerError::Tensor(_))
    ));
}
