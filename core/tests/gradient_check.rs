//! Finite-difference verification of the hand-derived backward pass.
//!
//! The loss is `L = sum(output * G)` for a fixed `G`, so `dL/doutput = G` is exactly the
//! incoming derivative handed to the layer. Every weight and input element is checked with
//! central differences in f64.

use mol_attn::nn::context::{InitContext, InputHandle, RunContext, WeightHandle};
use mol_attn::nn::{Layer, MolAttention, MolAttentionProps, MolSlots};
use mol_attn::tensor::Tensor;

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-4;
/// Gradients below this magnitude on both sides are under finite-difference resolution.
const ABS_THRESHOLD: f64 = 1e-8;

const UNIT: usize = 8;
const MOL_K: usize = 2;
const DQ: usize = 4;
const LEN: usize = 5;
const DV: usize = 3;

struct Harness {
    layer: MolAttention<f64>,
    ctx: RunContext<f64>,
    slots: MolSlots,
    dout: Tensor<f64, 4>,
}

#[derive(Clone, Copy, Debug)]
enum Target {
    Weight(WeightHandle),
    Input(InputHandle),
}

fn fill(t: &mut Tensor<f64, 4>, f: impl Fn(usize) -> f64) {
    for (i, v) in t.data_mut().iter_mut().enumerate() {
        *v = f(i);
    }
}

fn harness(batch: usize) -> Harness {
    let mut layer = MolAttention::with_props(
        MolAttentionProps::default()
            .with_unit(UNIT)
            .with_mol_k(MOL_K),
    );
    let mut init = InitContext::new(
        "attn",
        vec![
            [batch, 1, 1, DQ],
            [batch, 1, LEN, DV],
            [batch, 1, 1, MOL_K],
        ],
    );
    layer.finalize(&mut init).unwrap();
    let mut ctx = init.build::<f64>(0);
    let slots = *layer.slots().unwrap();

    // Smooth, moderate weights keep beta near 1 and the sigmoids well away from saturation.
    fill(ctx.weight_mut(slots.fc_w).unwrap(), |i| {
        0.4 * (i as f64 * 0.7 + 0.3).sin()
    });
    fill(ctx.weight_mut(slots.fc_bias).unwrap(), |i| {
        0.1 * (i as f64).cos()
    });
    fill(ctx.weight_mut(slots.fc_proj_w).unwrap(), |i| {
        0.3 * (i as f64 * 1.3 + 0.5).sin()
    });

    let mut query = Tensor::zeros([batch, 1, 1, DQ]);
    fill(&mut query, |i| 0.8 * (i as f64 * 0.9).sin());
    let mut value = Tensor::zeros([batch, 1, LEN, DV]);
    fill(&mut value, |i| (i as f64 * 0.45).cos());
    let mut state = Tensor::zeros([batch, 1, 1, MOL_K]);
    fill(&mut state, |i| 0.5 + i as f64 * 0.6);

    ctx.set_input(slots.query, query).unwrap();
    ctx.set_input(slots.value, value).unwrap();
    ctx.set_input(slots.state, state).unwrap();

    let mut dout = Tensor::zeros([batch, 1, 1, DV]);
    fill(&mut dout, |i| 1.0 - 0.35 * i as f64);

    Harness {
        layer,
        ctx,
        slots,
        dout,
    }
}

fn loss(h: &mut Harness) -> f64 {
    h.layer.forward(&mut h.ctx, true).unwrap();
    h.ctx
        .output(0)
        .unwrap()
        .data()
        .iter()
        .zip(h.dout.data())
        .map(|(o, g)| o * g)
        .sum()
}

fn perturb(h: &mut Harness, target: Target, idx: usize, delta: f64) {
    match target {
        Target::Weight(w) => h.ctx.weight_mut(w).unwrap().data_mut()[idx] += delta,
        Target::Input(i) => {
            let mut t = h.ctx.input(i).unwrap().clone();
            t.data_mut()[idx] += delta;
            h.ctx.set_input(i, t).unwrap();
        }
    }
}

fn numerical(h: &mut Harness, target: Target, idx: usize) -> f64 {
    perturb(h, target, idx, EPS);
    let plus = loss(h);
    perturb(h, target, idx, -2.0 * EPS);
    let minus = loss(h);
    perturb(h, target, idx, EPS);
    (plus - minus) / (2.0 * EPS)
}

/// Returns `(checked, passed, max_rel_err)`.
fn check(h: &mut Harness, name: &str, target: Target, analytic: &Tensor<f64, 4>) -> (usize, usize, f64) {
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f64;

    for (idx, &a) in analytic.data().iter().enumerate() {
        let n = numerical(h, target, idx);
        checked += 1;

        let denom = a.abs().max(n.abs());
        if denom < ABS_THRESHOLD {
            passed += 1;
            continue;
        }
        let rel_err = (a - n).abs() / denom;
        max_rel_err = max_rel_err.max(rel_err);
        if rel_err < TOL {
            passed += 1;
        } else {
            eprintln!("  FAIL {name}[{idx}]: analytical={a:.6e}, numerical={n:.6e}, rel_err={rel_err:.4e}");
        }
    }
    (checked, passed, max_rel_err)
}

/// Runs forward and both backward procedures, returning copies of every analytic gradient.
fn analytic(h: &mut Harness) -> Vec<(&'static str, Target, Tensor<f64, 4>)> {
    let s = h.slots;
    h.layer.forward(&mut h.ctx, true).unwrap();
    h.ctx.set_incoming_derivative(0, h.dout.clone()).unwrap();
    h.layer.calc_gradient(&mut h.ctx).unwrap();
    h.layer.calc_derivative(&mut h.ctx).unwrap();

    let w = |w: WeightHandle| h.ctx.weight_grad(w).unwrap().clone();
    let i = |i: InputHandle| h.ctx.outgoing_derivative(i).unwrap().clone();
    vec![
        ("fc_w", Target::Weight(s.fc_w), w(s.fc_w)),
        ("fc_bias", Target::Weight(s.fc_bias), w(s.fc_bias)),
        ("fc_proj_w", Target::Weight(s.fc_proj_w), w(s.fc_proj_w)),
        ("query", Target::Input(s.query), i(s.query)),
        ("value", Target::Input(s.value), i(s.value)),
        ("state", Target::Input(s.state), i(s.state)),
    ]
}

fn run_all(batch: usize) {
    let mut h = harness(batch);
    for (name, target, grad) in analytic(&mut h) {
        assert!(grad.all_finite(), "{name}: non-finite gradient");
        let (checked, passed, max_err) = check(&mut h, name, target, &grad);
        eprintln!("{name}: {passed}/{checked} pass, max_rel_err={max_err:.4e}");
        assert_eq!(
            passed, checked,
            "{name}: {passed}/{checked} passed, max_rel_err={max_err:.4e}"
        );
    }
}

#[test]
fn test_gradients_single_batch() {
    run_all(1);
}

#[test]
fn test_gradients_batched() {
    // Batch > 1 exercises the reduction of shared-weight gradients over the batch.
    run_all(3);
}

#[test]
fn test_state_gradient_is_kappa_gradient() {
    // m = state + kappa, so dL/dstate equals dL/dkappa before the exp chain rule.
    let mut h = harness(2);
    analytic(&mut h);

    let dstate = h.ctx.outgoing_derivative(h.slots.state).unwrap().clone();
    let kappa = h
        .layer
        .packed_segment(&h.ctx, mol_attn::nn::Segment::Kappa)
        .unwrap();
    let dkappa_src = h
        .layer
        .packed_grad_segment(&h.ctx, mol_attn::nn::Segment::Kappa)
        .unwrap();

    for ((ds, k), dk) in dstate.data().iter().zip(kappa.data()).zip(dkappa_src.data()) {
        assert!((ds * k - dk).abs() < 1e-12);
    }
}
