//! Mixture-of-Logistics (MoL) Attention.
//!
//! # What is MoL Attention?
//!
//! Content-based attention scores every position of a sequence by similarity to a query.
//! **Location-sensitive** attention instead predicts *where* to look: a small network turns
//! the query into a probability distribution over positions, and the distribution moves
//! forward as decoding proceeds. MoL attention (used in monotonic TTS alignment) describes
//! that distribution as a mixture of `K` discretized logistic distributions.
//!
//! # The Computation
//!
//! For a query $q$, value sequence $V \in \mathbb{R}^{L \times D_v}$ and running state $s$:
//!
//! 1. **Projection**: $p = \tanh(q W_1 + b_1)\, W_2$, a packed `[3K]` vector of logits.
//! 2. **Mixture parameters** from the three `K`-wide segments of $p$:
//!    - step $\kappa = e^{p_\kappa}$, scale $\beta = e^{p_\beta}$, weights $\alpha = \text{softmax}(p_\alpha)$.
//!    - centers $m = s + \kappa$. Since $\kappa > 0$ the centers only ever move forward.
//! 3. **Bin probabilities**: position $h$ (1-based) owns the interval $[h - 0.5, h + 0.5]$ and
//!    $$ P_k(h) = \sigma\!\left(\frac{h + 0.5 - m_k}{\beta_k}\right) - \sigma\!\left(\frac{h - 0.5 - m_k}{\beta_k}\right) $$
//! 4. **Scores**: $a_h = \sum_k \alpha_k P_k(h)$.
//! 5. **Context**: $c = a\, V$.
//!
//! > [!NOTE]
//! > The scores are **not** renormalized over the sequence. Mass that falls outside
//! > `[0.5, L + 0.5]` is simply lost, so $\sum_h a_h \le 1$.
//!
//! # Backward
//!
//! Both gradient procedures need $\partial L / \partial p$ (the packed-gradient buffer).
//! It is computed once per backward step by a shared helper and memoized until the next
//! forward call, so `calc_derivative` and `calc_gradient` can run in either order.

mod props;

pub use props::MolAttentionProps;

use crate::nn::activation::Activation;
use crate::nn::context::{
    InitContext, InputHandle, Lifespan, RunContext, TensorDim, TensorHandle,
    WeightHandle,
};
use crate::nn::error::{LayerError, Result};
use crate::nn::layer::Layer;
use crate::tensor::ops::row_grid;
use crate::tensor::{Tensor, TensorElem, TensorError};
use num_traits::Float;

/// Registry type name of the layer.
pub const LAYER_TYPE: &str = "mol_attention";

const NUM_INPUTS: usize = 3;

/// Floor added to the logistic scale before dividing by it.
const BETA_EPS: f64 = 1e-8;

fn constant<T: TensorElem>(v: f64) -> T {
    T::from_f64(v).unwrap_or_else(T::zero)
}

/// One of the three `K`-wide segments of the packed projection buffer, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Center step (`exp` applied in forward).
    Kappa,
    /// Logistic scale (`exp` applied in forward).
    Beta,
    /// Mixture weights (`softmax` applied in forward).
    Alpha,
}

impl Segment {
    pub const fn offset(self, mol_k: usize) -> usize {
        match self {
            Segment::Kappa => 0,
            Segment::Beta => mol_k,
            Segment::Alpha => 2 * mol_k,
        }
    }
}

/// Handles to every buffer the layer touches, fixed at `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MolSlots {
    pub query: InputHandle,
    pub value: InputHandle,
    pub state: InputHandle,
    pub fc_w: WeightHandle,
    pub fc_bias: WeightHandle,
    pub fc_proj_w: WeightHandle,
    pub fc_out: TensorHandle,
    pub fc_tanh: TensorHandle,
    /// Packed `[kappa | beta | alpha]` buffer; its gradient buffer holds the packed gradient.
    pub fc_proj_out: TensorHandle,
    pub scores: TensorHandle,
    pub prob: TensorHandle,
    pub prob_left: TensorHandle,
    pub prob_right: TensorHandle,
    pub u_neg_div: TensorHandle,
    pub u_pos_div: TensorHandle,
}

impl MolSlots {
    /// The nine scratch buffers, in request order.
    pub fn scratch(&self) -> [TensorHandle; 9] {
        [
            self.fc_out,
            self.fc_tanh,
            self.fc_proj_out,
            self.scores,
            self.prob,
            self.prob_left,
            self.prob_right,
            self.u_neg_div,
            self.u_pos_div,
        ]
    }
}

/// State of the shared backward helper.
#[derive(Debug, Clone)]
enum HelperCache<T: TensorElem> {
    /// Scratch buffers hold nothing usable.
    NoForward,
    /// Forward ran; the packed gradient has not been computed yet.
    Pending,
    /// The packed gradient buffer is current; `dstate` is the recurrent-state gradient.
    Cached { dstate: Tensor<T, 4> },
}

/// Mixture-of-Logistics attention layer.
///
/// Inputs are `query [B, 1, 1, Dq]`, `value [B, 1, L, Dv]` and `state [B, 1, 1, K]`;
/// the single output is the context vector `[B, 1, 1, Dv]`.
///
/// The output width is the value width `Dv`, not the query width `Dq`.
///
/// # Examples
///
/// ```rust
/// use mol_attn::nn::{Layer, MolAttention};
/// use mol_attn::nn::context::InitContext;
/// use mol_attn::tensor::Tensor;
///
/// let mut layer = MolAttention::<f32>::new();
/// layer.set_property(&["unit=8", "mol_k=2"]).unwrap();
///
/// let mut init = InitContext::new("attn", vec![[1, 1, 1, 4], [1, 1, 5, 3], [1, 1, 1, 2]]);
/// layer.finalize(&mut init).unwrap();
/// let mut ctx = init.build::<f32>(0);
///
/// let slots = *layer.slots().unwrap();
/// ctx.set_input(slots.query, Tensor::ones([1, 1, 1, 4])).unwrap();
/// ctx.set_input(slots.value, Tensor::ones([1, 1, 5, 3])).unwrap();
/// layer.forward(&mut ctx, true).unwrap();
///
/// assert_eq!(ctx.output(0).unwrap().shape(), &[1, 1, 1, 3]);
/// ```
#[derive(Debug)]
pub struct MolAttention<T: TensorElem> {
    props: MolAttentionProps,
    slots: Option<MolSlots>,
    cache: HelperCache<T>,
    helper_runs: usize,
}

impl<T: TensorElem + Float> Default for MolAttention<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElem + Float> MolAttention<T> {
    pub fn new() -> Self {
        Self::with_props(MolAttentionProps::default())
    }

    pub fn with_props(props: MolAttentionProps) -> Self {
        Self {
            props,
            slots: None,
            cache: HelperCache::NoForward,
            helper_runs: 0,
        }
    }

    pub fn props(&self) -> &MolAttentionProps {
        &self.props
    }

    /// Buffer handles, available after `finalize`.
    pub fn slots(&self) -> Result<&MolSlots> {
        self.slots.as_ref().ok_or(LayerError::NotFinalized)
    }

    /// Number of times the shared backward helper has actually run.
    pub fn helper_runs(&self) -> usize {
        self.helper_runs
    }

    /// Whether the packed gradient for the latest forward call is available.
    pub fn has_cached_gradient(&self) -> bool {
        matches!(self.cache, HelperCache::Cached { .. })
    }

    fn mol_k(&self) -> Result<usize> {
        self.props.mol_k.ok_or(LayerError::MissingProperty {
            layer: LAYER_TYPE,
            property: "mol_k",
        })
    }

    /// Copies one segment of the packed projection buffer (post-activation after forward).
    pub fn packed_segment(&self, ctx: &RunContext<T>, segment: Segment) -> Result<Tensor<T, 4>> {
        let k = self.mol_k()?;
        let packed = ctx.tensor(self.slots()?.fc_proj_out)?;
        Ok(packed.view_last_axis(segment.offset(k), k)?.to_tensor())
    }

    /// Copies one segment of the packed gradient buffer.
    pub fn packed_grad_segment(
        &self,
        ctx: &RunContext<T>,
        segment: Segment,
    ) -> Result<Tensor<T, 4>> {
        let k = self.mol_k()?;
        let packed = ctx.tensor_grad(self.slots()?.fc_proj_out)?;
        Ok(packed.view_last_axis(segment.offset(k), k)?.to_tensor())
    }

    /// Mixture centers `m = state + kappa` of the latest forward call.
    ///
    /// Feeding them back as the next state makes the attention window advance monotonically.
    pub fn mixture_centers(&self, ctx: &RunContext<T>) -> Result<Tensor<T, 4>> {
        if matches!(self.cache, HelperCache::NoForward) {
            return Err(LayerError::ForwardNotRun);
        }
        let kappa = self.packed_segment(ctx, Segment::Kappa)?;
        Ok((ctx.input(self.slots()?.state)? + &kappa)?)
    }

    /// Runs the shared backward helper unless its result is already cached.
    fn ensure_packed_grad(&mut self, ctx: &mut RunContext<T>) -> Result<()> {
        match self.cache {
            HelperCache::NoForward => return Err(LayerError::ForwardNotRun),
            HelperCache::Cached { .. } => return Ok(()),
            HelperCache::Pending => {}
        }

        let dstate = self.compute_packed_grad(ctx)?;
        self.helper_runs += 1;
        self.cache = HelperCache::Cached { dstate };
        Ok(())
    }

    /// Writes `dL/d(fc_proj_out)` into the packed gradient buffer and returns `dL/dstate`.
    fn compute_packed_grad(&self, ctx: &mut RunContext<T>) -> Result<Tensor<T, 4>> {
        let s = *self.slots()?;
        let k = self.mol_k()?;
        tracing::trace!(layer = %ctx.name(), "computing packed projection gradient");

        let dout = ctx.incoming_derivative(0)?;
        let value = ctx.input(s.value)?;
        let [batch, _, len, _] = *value.shape();

        // dscores [B, 1, 1, L] laid out as a column per batch entry.
        let dscores = Tensor::matmul_grad_lhs(dout, value)?.reshape([batch, 1, len, 1])?;
        let dprob_scaled = dscores.broadcast_to([batch, 1, len, k])?;

        let packed = ctx.tensor(s.fc_proj_out)?;
        let kappa = packed.view_last_axis(Segment::Kappa.offset(k), k)?.to_tensor();
        let beta = packed.view_last_axis(Segment::Beta.offset(k), k)?.to_tensor();
        let alpha = packed.view_last_axis(Segment::Alpha.offset(k), k)?.to_tensor();

        let dalpha = (&dprob_scaled * ctx.tensor(s.prob)?)?.sum_axes(&[2])?;
        let dprob = (&dprob_scaled * &alpha)?;
        let dprob_right = dprob.neg();

        let du_pos_div = Activation::Sigmoid.backward(ctx.tensor(s.prob_left)?, &dprob)?;
        let du_neg_div = Activation::Sigmoid.backward(ctx.tensor(s.prob_right)?, &dprob_right)?;

        let eps = constant::<T>(BETA_EPS);
        let beta_eps = beta.map(|b| b + eps);
        let du_pos_m = (&du_pos_div / &beta_eps)?;
        let du_neg_m = (&du_neg_div / &beta_eps)?;

        let dm_pos = du_pos_m.sum_axes(&[2])?.neg();
        let dm_neg = du_neg_m.sum_axes(&[2])?.neg();
        let dbeta_pos = (&du_pos_m * ctx.tensor(s.u_pos_div)?)?
            .sum_axes(&[2])?
            .neg();
        let dbeta_neg = (&du_neg_m * ctx.tensor(s.u_neg_div)?)?
            .sum_axes(&[2])?
            .neg();

        let dbeta = (&dbeta_pos + &dbeta_neg)?;
        // m = state + kappa, so both receive dm unchanged.
        let dkappa = (&dm_pos + &dm_neg)?;

        let dkappa_src = (&dkappa * &kappa)?;
        let dbeta_src = (&dbeta * &beta)?;
        let dalpha_src = Activation::Softmax.backward(&alpha, &dalpha)?;

        let mut packed_grad = Tensor::zeros([batch, 1, 1, 3 * k]);
        packed_grad
            .view_last_axis_mut(Segment::Kappa.offset(k), k)?
            .copy_from(&dkappa_src)?;
        packed_grad
            .view_last_axis_mut(Segment::Beta.offset(k), k)?
            .copy_from(&dbeta_src)?;
        packed_grad
            .view_last_axis_mut(Segment::Alpha.offset(k), k)?
            .copy_from(&dalpha_src)?;
        ctx.set_tensor_grad(s.fc_proj_out, packed_grad)?;

        Ok(dkappa)
    }

    /// `dL/d(fc_out)` from the packed gradient, through `fc_proj_w` and tanh.
    fn fc_out_grad(&self, ctx: &RunContext<T>) -> Result<Tensor<T, 4>> {
        let s = self.slots()?;
        let dfc_tanh =
            Tensor::matmul_grad_lhs(ctx.tensor_grad(s.fc_proj_out)?, ctx.weight(s.fc_proj_w)?)?;
        Ok(Activation::Tanh.backward(ctx.tensor(s.fc_tanh)?, &dfc_tanh)?)
    }
}

fn expect_batch(name: &str, got: &TensorDim, batch: usize) -> Result<()> {
    if got[0] != batch {
        tracing::debug!(input = name, expected = batch, got = got[0], "batch mismatch");
        let mut expected = *got;
        expected[0] = batch;
        return Err(TensorError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
        .into());
    }
    Ok(())
}

impl<T: TensorElem + Float> Layer<T> for MolAttention<T> {
    fn layer_type(&self) -> &'static str {
        LAYER_TYPE
    }

    fn set_property(&mut self, values: &[&str]) -> Result<()> {
        self.props.load(values)
    }

    fn export_properties(&self) -> Vec<(String, String)> {
        self.props.export()
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        if ctx.num_inputs() != NUM_INPUTS {
            return Err(LayerError::InvalidInputCount {
                layer: LAYER_TYPE,
                expected: NUM_INPUTS,
                got: ctx.num_inputs(),
            });
        }
        let unit = self.props.unit.ok_or(LayerError::MissingProperty {
            layer: LAYER_TYPE,
            property: "unit",
        })?;
        let k = self.mol_k()?;
        for (property, v) in [("unit", unit), ("mol_k", k)] {
            if v == 0 {
                return Err(LayerError::InvalidProperty {
                    property: property.to_string(),
                    value: v.to_string(),
                });
            }
        }

        let query_dim = ctx.input_dims()[0];
        let value_dim = ctx.input_dims()[1];
        let state_dim = ctx.input_dims()[2];
        let batch = query_dim[0];
        expect_batch("value", &value_dim, batch)?;
        expect_batch("state", &state_dim, batch)?;
        if state_dim[1..] != [1, 1, k] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, 1, 1, k],
                got: state_dim.to_vec(),
            }
            .into());
        }

        let dq = query_dim[3];
        let len = value_dim[2];
        let dv = value_dim[3];

        let query = ctx.input_handle(0)?;
        let value = ctx.input_handle(1)?;
        let state = ctx.input_handle(2)?;

        let p = &self.props;
        let fc_w = ctx.request_weight(
            [1, 1, dq, unit],
            p.weight_initializer,
            p.weight_regularizer,
            p.weight_regularizer_constant,
            "fc_w",
            true,
        );
        let fc_bias = ctx.request_weight(
            [1, 1, 1, unit],
            p.bias_initializer,
            p.weight_regularizer,
            p.weight_regularizer_constant,
            "fc_bias",
            true,
        );
        let fc_proj_w = ctx.request_weight(
            [1, 1, unit, 3 * k],
            p.weight_initializer,
            p.weight_regularizer,
            p.weight_regularizer_constant,
            "fc_proj_w",
            true,
        );

        let hidden_dim = [batch, 1, 1, unit];
        let prob_dim = [batch, 1, len, k];
        let it = Lifespan::Iteration;
        let fc_out = ctx.request_tensor(hidden_dim, "fc_out", false, it);
        let fc_tanh = ctx.request_tensor(hidden_dim, "fc_tanh", false, it);
        let fc_proj_out = ctx.request_tensor([batch, 1, 1, 3 * k], "fc_proj_out", true, it);
        let scores = ctx.request_tensor([batch, 1, 1, len], "scores", false, it);
        let prob = ctx.request_tensor(prob_dim, "prob", false, it);
        let prob_left = ctx.request_tensor(prob_dim, "prob_left", false, it);
        let prob_right = ctx.request_tensor(prob_dim, "prob_right", false, it);
        let u_neg_div = ctx.request_tensor(prob_dim, "u_neg_div", false, it);
        let u_pos_div = ctx.request_tensor(prob_dim, "u_pos_div", false, it);

        ctx.set_output_dims(vec![[batch, 1, 1, dv]]);

        self.slots = Some(MolSlots {
            query,
            value,
            state,
            fc_w,
            fc_bias,
            fc_proj_w,
            fc_out,
            fc_tanh,
            fc_proj_out,
            scores,
            prob,
            prob_left,
            prob_right,
            u_neg_div,
            u_pos_div,
        });
        self.cache = HelperCache::NoForward;

        tracing::debug!(
            layer = %ctx.name(),
            batch,
            query_width = dq,
            unit,
            mol_k = k,
            len,
            value_width = dv,
            "finalized mol attention"
        );
        Ok(())
    }

    fn forward(&mut self, ctx: &mut RunContext<T>, _training: bool) -> Result<()> {
        let s = *self.slots()?;
        let k = self.mol_k()?;
        // Scratch buffers are about to be overwritten; a failed forward leaves nothing usable.
        self.cache = HelperCache::NoForward;

        let query = ctx.input(s.query)?;
        let value = ctx.input(s.value)?;
        let state = ctx.input(s.state)?;
        let batch = query.shape()[0];
        let len = value.shape()[2];
        expect_batch("value", value.shape(), batch)?;
        expect_batch("state", state.shape(), batch)?;
        tracing::trace!(layer = %ctx.name(), batch, len, "mol attention forward");

        let fc_out = (&query.matmul(ctx.weight(s.fc_w)?)? + ctx.weight(s.fc_bias)?)?;
        let fc_tanh = Activation::Tanh.forward(&fc_out);
        let mut packed = fc_tanh.matmul(ctx.weight(s.fc_proj_w)?)?;

        let kappa = packed
            .view_last_axis(Segment::Kappa.offset(k), k)?
            .to_tensor()
            .map(Float::exp);
        let beta = packed
            .view_last_axis(Segment::Beta.offset(k), k)?
            .to_tensor()
            .map(Float::exp);
        let alpha =
            Activation::Softmax.forward(&packed.view_last_axis(Segment::Alpha.offset(k), k)?.to_tensor());
        packed
            .view_last_axis_mut(Segment::Kappa.offset(k), k)?
            .copy_from(&kappa)?;
        packed
            .view_last_axis_mut(Segment::Beta.offset(k), k)?
            .copy_from(&beta)?;
        packed
            .view_last_axis_mut(Segment::Alpha.offset(k), k)?
            .copy_from(&alpha)?;

        let m = (state + &kappa)?;

        // Position h (0-based) covers [h + 0.5, h + 1.5].
        let u_base = row_grid(len, k, |h| constant::<T>((h + 1) as f64));
        let half = constant::<T>(0.5);
        let u_pos = u_base.map(|u| u + half);
        let u_neg = u_base.map(|u| u - half);
        let eps = constant::<T>(BETA_EPS);
        let beta_eps = beta.map(|b| b + eps);

        let u_pos_div = (&(&u_pos - &m)? / &beta_eps)?;
        let prob_left = Activation::Sigmoid.forward(&u_pos_div);
        let u_neg_div = (&(&u_neg - &m)? / &beta_eps)?;
        let prob_right = Activation::Sigmoid.forward(&u_neg_div);
        let prob = (&prob_left - &prob_right)?;

        let scores = (&prob * &alpha)?
            .sum_axes(&[3])?
            .reshape([batch, 1, 1, len])?;
        let output = scores.matmul(value)?;

        ctx.set_tensor(s.fc_out, fc_out)?;
        ctx.set_tensor(s.fc_tanh, fc_tanh)?;
        ctx.set_tensor(s.fc_proj_out, packed)?;
        ctx.set_tensor(s.scores, scores)?;
        ctx.set_tensor(s.prob, prob)?;
        ctx.set_tensor(s.prob_left, prob_left)?;
        ctx.set_tensor(s.prob_right, prob_right)?;
        ctx.set_tensor(s.u_neg_div, u_neg_div)?;
        ctx.set_tensor(s.u_pos_div, u_pos_div)?;
        ctx.set_output(0, output)?;

        self.cache = HelperCache::Pending;
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &mut RunContext<T>) -> Result<()> {
        let s = *self.slots()?;
        if matches!(self.cache, HelperCache::NoForward) {
            return Err(LayerError::ForwardNotRun);
        }
        tracing::trace!(layer = %ctx.name(), "mol attention input gradients");

        let dvalue = Tensor::matmul_grad_rhs(
            ctx.tensor(s.scores)?,
            ctx.incoming_derivative(0)?,
            *ctx.input(s.value)?.shape(),
        )?;

        self.ensure_packed_grad(ctx)?;
        let dfc_out = self.fc_out_grad(ctx)?;
        let dquery = Tensor::matmul_grad_lhs(&dfc_out, ctx.weight(s.fc_w)?)?;
        let dstate = match &self.cache {
            HelperCache::Cached { dstate } => dstate.clone(),
            _ => return Err(LayerError::ForwardNotRun),
        };

        ctx.set_outgoing_derivative(s.query, dquery)?;
        ctx.set_outgoing_derivative(s.value, dvalue)?;
        ctx.set_outgoing_derivative(s.state, dstate)?;
        Ok(())
    }

    fn calc_gradient(&mut self, ctx: &mut RunContext<T>) -> Result<()> {
        let s = *self.slots()?;
        self.ensure_packed_grad(ctx)?;
        tracing::trace!(layer = %ctx.name(), "mol attention weight gradients");

        let dfc_proj_w = Tensor::matmul_grad_rhs(
            ctx.tensor(s.fc_tanh)?,
            ctx.tensor_grad(s.fc_proj_out)?,
            *ctx.weight(s.fc_proj_w)?.shape(),
        )?;
        let dfc_out = self.fc_out_grad(ctx)?;
        let dfc_w =
            Tensor::matmul_grad_rhs(ctx.input(s.query)?, &dfc_out, *ctx.weight(s.fc_w)?.shape())?;
        let dfc_bias = dfc_out.sum_axes(&[0, 1, 2])?;

        ctx.set_weight_grad(s.fc_proj_w, dfc_proj_w)?;
        ctx.set_weight_grad(s.fc_w, dfc_w)?;
        ctx.set_weight_grad(s.fc_bias, dfc_bias)?;
        Ok(())
    }

    fn set_batch(&mut self, ctx: &mut RunContext<T>, batch: usize) -> Result<()> {
        let s = *self.slots()?;
        for h in s.scratch() {
            ctx.update_tensor(h, batch)?;
        }
        self.cache = HelperCache::NoForward;
        tracing::debug!(layer = %ctx.name(), batch, "resized mol attention buffers");
        Ok(())
    }
}
