//! Resource registry for layers.
//!
//! # Two Phases
//!
//! A layer never allocates its own buffers. Instead:
//!
//! 1. **Setup** ([`InitContext`]): the layer inspects its declared input dimensions and
//!    *requests* weights and scratch tensors by shape. Every request returns a typed handle.
//! 2. **Run** ([`RunContext`]): [`InitContext::build`] allocates everything that was requested.
//!    The layer reads and writes buffers through the handles it kept from setup.
//!
//! ```rust
//! use mol_attn::nn::context::{InitContext, Initializer, Lifespan, Regularizer};
//!
//! let mut init = InitContext::new("demo", vec![[2, 1, 1, 4]]);
//! let w = init.request_weight([1, 1, 4, 3], Initializer::Ones, Regularizer::None, 1.0, "w", true);
//! let h = init.request_tensor([2, 1, 1, 3], "hidden", false, Lifespan::Iteration);
//!
//! let ctx = init.build::<f32>(0);
//! assert_eq!(ctx.weight(w).unwrap().data(), &[1.0; 12]);
//! assert_eq!(ctx.tensor(h).unwrap().shape(), &[2, 1, 1, 3]);
//! ```
//!
//! > [!TIP]
//! > Handles are plain indices with distinct types, so a weight handle can never be used to
//! > fetch a scratch tensor. They are `Copy` and cheap to keep in a layer struct.

use super::error::{LayerError, Result};
use crate::tensor::{Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

/// A 4-D `[batch, channel, height, width]` shape.
pub type TensorDim = [usize; 4];

/// Handle to one of the layer's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle(usize);

/// Handle to a registry-owned weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightHandle(usize);

/// Handle to a registry-owned scratch tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(usize);

impl InputHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl WeightHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl TensorHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Weight initialization schemes.
///
/// `fan_in` and `fan_out` are the last two extents of the weight shape, so a
/// `[1, 1, in, out]` matrix has `fan_in = in` and a `[1, 1, 1, out]` bias has `fan_in = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initializer {
    Zeros,
    Ones,
    /// $U(-a, a)$ with $a = \sqrt{6 / (\text{fan\_in} + \text{fan\_out})}$.
    XavierUniform,
    /// $U(-a, a)$ with $a = \sqrt{6 / \text{fan\_in}}$.
    HeUniform,
    /// $U(-a, a)$ with $a = \sqrt{3 / \text{fan\_in}}$.
    LecunUniform,
}

impl Initializer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initializer::Zeros => "zeros",
            Initializer::Ones => "ones",
            Initializer::XavierUniform => "xavier_uniform",
            Initializer::HeUniform => "he_uniform",
            Initializer::LecunUniform => "lecun_uniform",
        }
    }

    fn fill<T: TensorElem + Float>(&self, dim: TensorDim, rng: &mut StdRng) -> Tensor<T, 4> {
        let fan_in = dim[2].max(1) as f64;
        let fan_out = dim[3].max(1) as f64;
        let limit = match self {
            Initializer::Zeros => return Tensor::zeros(dim),
            Initializer::Ones => return Tensor::ones(dim),
            Initializer::XavierUniform => (6.0 / (fan_in + fan_out)).sqrt(),
            Initializer::HeUniform => (6.0 / fan_in).sqrt(),
            Initializer::LecunUniform => (3.0 / fan_in).sqrt(),
        };

        let mut t = Tensor::zeros(dim);
        for v in t.data_mut() {
            *v = T::from_f64(rng.random_range(-limit..limit)).unwrap_or_else(T::zero);
        }
        t
    }
}

impl FromStr for Initializer {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zeros" => Ok(Initializer::Zeros),
            "ones" => Ok(Initializer::Ones),
            "xavier_uniform" => Ok(Initializer::XavierUniform),
            "he_uniform" => Ok(Initializer::HeUniform),
            "lecun_uniform" => Ok(Initializer::LecunUniform),
            _ => Err(LayerError::InvalidProperty {
                property: "initializer".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight regularization applied through [`RunContext::apply_regularization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regularizer {
    None,
    /// Loss $\frac{\lambda}{2} \lVert w \rVert^2$, gradient $\lambda w$.
    L2Norm,
}

impl Regularizer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regularizer::None => "none",
            Regularizer::L2Norm => "l2norm",
        }
    }
}

impl FromStr for Regularizer {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Regularizer::None),
            "l2norm" => Ok(Regularizer::L2Norm),
            _ => Err(LayerError::InvalidProperty {
                property: "regularizer".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Regularizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a scratch tensor's contents must stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Valid from forward until the end of the matching backward step.
    Iteration,
    /// Valid for the lifetime of the context.
    Max,
}

#[derive(Debug, Clone)]
struct WeightSpec {
    name: String,
    dim: TensorDim,
    initializer: Initializer,
    regularizer: Regularizer,
    regularizer_constant: f64,
    trainable: bool,
}

#[derive(Debug, Clone)]
struct TensorSpec {
    name: String,
    dim: TensorDim,
    need_grad: bool,
    lifespan: Lifespan,
}

/// Setup-time view of the registry.
#[derive(Debug, Clone)]
pub struct InitContext {
    name: String,
    input_dims: Vec<TensorDim>,
    output_dims: Vec<TensorDim>,
    weights: Vec<WeightSpec>,
    tensors: Vec<TensorSpec>,
}

impl InitContext {
    /// Creates a setup context for a layer called `name` with the given input dimensions.
    pub fn new(name: impl Into<String>, input_dims: Vec<TensorDim>) -> Self {
        Self {
            name: name.into(),
            input_dims,
            output_dims: Vec::new(),
            weights: Vec::new(),
            tensors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.input_dims.len()
    }

    pub fn input_dims(&self) -> &[TensorDim] {
        &self.input_dims
    }

    pub fn output_dims(&self) -> &[TensorDim] {
        &self.output_dims
    }

    /// Returns the handle of input `index`.
    ///
    /// # Errors
    ///
    /// Returns `LayerError::InvalidHandle` if fewer inputs were declared.
    pub fn input_handle(&self, index: usize) -> Result<InputHandle> {
        if index >= self.input_dims.len() {
            return Err(LayerError::InvalidHandle {
                kind: "input",
                index,
            });
        }
        Ok(InputHandle(index))
    }

    pub fn set_output_dims(&mut self, dims: Vec<TensorDim>) {
        self.output_dims = dims;
    }

    /// Requests a weight tensor.
    pub fn request_weight(
        &mut self,
        dim: TensorDim,
        initializer: Initializer,
        regularizer: Regularizer,
        regularizer_constant: f64,
        name: &str,
        trainable: bool,
    ) -> WeightHandle {
        self.weights.push(WeightSpec {
            name: format!("{}:{}", self.name, name),
            dim,
            initializer,
            regularizer,
            regularizer_constant,
            trainable,
        });
        WeightHandle(self.weights.len() - 1)
    }

    /// Requests a scratch tensor, optionally paired with a gradient buffer of the same shape.
    pub fn request_tensor(
        &mut self,
        dim: TensorDim,
        name: &str,
        need_grad: bool,
        lifespan: Lifespan,
    ) -> TensorHandle {
        self.tensors.push(TensorSpec {
            name: format!("{}:{}", self.name, name),
            dim,
            need_grad,
            lifespan,
        });
        TensorHandle(self.tensors.len() - 1)
    }

    /// Allocates every requested buffer. Weights are initialized from `seed`.
    pub fn build<T: TensorElem + Float>(&self, seed: u64) -> RunContext<T> {
        let mut rng = StdRng::seed_from_u64(seed);

        let weights = self
            .weights
            .iter()
            .map(|spec| WeightSlot {
                value: spec.initializer.fill(spec.dim, &mut rng),
                grad: Tensor::zeros(spec.dim),
                spec: spec.clone(),
            })
            .collect();
        let tensors = self
            .tensors
            .iter()
            .map(|spec| TensorSlot {
                value: Tensor::zeros(spec.dim),
                grad: spec.need_grad.then(|| Tensor::zeros(spec.dim)),
                spec: spec.clone(),
            })
            .collect();

        tracing::debug!(
            layer = %self.name,
            weights = self.weights.len(),
            tensors = self.tensors.len(),
            "allocated run context"
        );

        RunContext {
            name: self.name.clone(),
            input_dims: self.input_dims.clone(),
            output_dims: self.output_dims.clone(),
            inputs: self.input_dims.iter().map(|d| Tensor::zeros(*d)).collect(),
            outgoing: self.input_dims.iter().map(|d| Tensor::zeros(*d)).collect(),
            outputs: self.output_dims.iter().map(|d| Tensor::zeros(*d)).collect(),
            incoming: self.output_dims.iter().map(|d| Tensor::zeros(*d)).collect(),
            weights,
            tensors,
        }
    }
}

#[derive(Debug)]
struct WeightSlot<T: TensorElem> {
    spec: WeightSpec,
    value: Tensor<T, 4>,
    grad: Tensor<T, 4>,
}

#[derive(Debug)]
struct TensorSlot<T: TensorElem> {
    spec: TensorSpec,
    value: Tensor<T, 4>,
    grad: Option<Tensor<T, 4>>,
}

/// Checks everything but the batch axis.
fn check_non_batch(expected: &TensorDim, got: &TensorDim) -> Result<()> {
    if expected[1..] != got[1..] {
        return Err(TensorError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
        .into());
    }
    Ok(())
}

fn check_exact(expected: &TensorDim, got: &TensorDim) -> Result<()> {
    if expected != got {
        return Err(TensorError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
        .into());
    }
    Ok(())
}

/// Run-time view of the registry: owns every buffer a layer touches.
#[derive(Debug)]
pub struct RunContext<T: TensorElem> {
    name: String,
    input_dims: Vec<TensorDim>,
    output_dims: Vec<TensorDim>,
    inputs: Vec<Tensor<T, 4>>,
    outgoing: Vec<Tensor<T, 4>>,
    outputs: Vec<Tensor<T, 4>>,
    incoming: Vec<Tensor<T, 4>>,
    weights: Vec<WeightSlot<T>>,
    tensors: Vec<TensorSlot<T>>,
}

impl<T: TensorElem + Float> RunContext<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    // -- inputs and outgoing derivatives --

    pub fn input(&self, h: InputHandle) -> Result<&Tensor<T, 4>> {
        self.inputs.get(h.0).ok_or(LayerError::InvalidHandle {
            kind: "input",
            index: h.0,
        })
    }

    /// Stores input `h`. Every axis but the batch axis must match the declared dimension.
    pub fn set_input(&mut self, h: InputHandle, t: Tensor<T, 4>) -> Result<()> {
        let dim = self.input_dims.get(h.0).ok_or(LayerError::InvalidHandle {
            kind: "input",
            index: h.0,
        })?;
        check_non_batch(dim, t.shape())?;
        self.inputs[h.0] = t;
        Ok(())
    }

    /// Derivative of the loss with respect to input `h`, written by the layer.
    pub fn outgoing_derivative(&self, h: InputHandle) -> Result<&Tensor<T, 4>> {
        self.outgoing.get(h.0).ok_or(LayerError::InvalidHandle {
            kind: "input",
            index: h.0,
        })
    }

    pub fn set_outgoing_derivative(&mut self, h: InputHandle, t: Tensor<T, 4>) -> Result<()> {
        let expected = *self.input(h)?.shape();
        check_exact(&expected, t.shape())?;
        self.outgoing[h.0] = t;
        Ok(())
    }

    // -- outputs and incoming derivatives --

    pub fn output(&self, index: usize) -> Result<&Tensor<T, 4>> {
        self.outputs.get(index).ok_or(LayerError::InvalidHandle {
            kind: "output",
            index,
        })
    }

    pub fn set_output(&mut self, index: usize, t: Tensor<T, 4>) -> Result<()> {
        let dim = self.output_dims.get(index).ok_or(LayerError::InvalidHandle {
            kind: "output",
            index,
        })?;
        check_non_batch(dim, t.shape())?;
        self.outputs[index] = t;
        Ok(())
    }

    /// Derivative of the loss with respect to output `index`, supplied by the caller.
    pub fn incoming_derivative(&self, index: usize) -> Result<&Tensor<T, 4>> {
        self.incoming.get(index).ok_or(LayerError::InvalidHandle {
            kind: "output",
            index,
        })
    }

    pub fn set_incoming_derivative(&mut self, index: usize, t: Tensor<T, 4>) -> Result<()> {
        let dim = self.output_dims.get(index).ok_or(LayerError::InvalidHandle {
            kind: "output",
            index,
        })?;
        check_non_batch(dim, t.shape())?;
        self.incoming[index] = t;
        Ok(())
    }

    // -- weights --

    fn weight_slot(&self, h: WeightHandle) -> Result<&WeightSlot<T>> {
        self.weights.get(h.0).ok_or(LayerError::InvalidHandle {
            kind: "weight",
            index: h.0,
        })
    }

    fn weight_slot_mut(&mut self, h: WeightHandle) -> Result<&mut WeightSlot<T>> {
        self.weights.get_mut(h.0).ok_or(LayerError::InvalidHandle {
            kind: "weight",
            index: h.0,
        })
    }

    pub fn weight(&self, h: WeightHandle) -> Result<&Tensor<T, 4>> {
        Ok(&self.weight_slot(h)?.value)
    }

    pub fn weight_mut(&mut self, h: WeightHandle) -> Result<&mut Tensor<T, 4>> {
        Ok(&mut self.weight_slot_mut(h)?.value)
    }

    pub fn weight_name(&self, h: WeightHandle) -> Result<&str> {
        Ok(&self.weight_slot(h)?.spec.name)
    }

    pub fn is_trainable(&self, h: WeightHandle) -> Result<bool> {
        Ok(self.weight_slot(h)?.spec.trainable)
    }

    pub fn weight_grad(&self, h: WeightHandle) -> Result<&Tensor<T, 4>> {
        Ok(&self.weight_slot(h)?.grad)
    }

    /// Overwrites the gradient of weight `h`.
    pub fn set_weight_grad(&mut self, h: WeightHandle, t: Tensor<T, 4>) -> Result<()> {
        let slot = self.weight_slot_mut(h)?;
        check_exact(&slot.spec.dim, t.shape())?;
        slot.grad = t;
        Ok(())
    }

    /// Sum of the regularization losses of every weight.
    pub fn regularization_loss(&self) -> T {
        self.weights
            .iter()
            .filter(|slot| slot.spec.regularizer == Regularizer::L2Norm)
            .fold(T::zero(), |acc, slot| {
                let lambda = T::from_f64(slot.spec.regularizer_constant).unwrap_or_else(T::zero);
                let sq = slot
                    .value
                    .data()
                    .iter()
                    .fold(T::zero(), |s, &w| s + w * w);
                let half = T::from_f64(0.5).unwrap_or_else(T::zero);
                acc + half * lambda * sq
            })
    }

    /// Adds `λ·w` to the gradient of every trainable, L2-regularized weight.
    pub fn apply_regularization(&mut self) {
        for slot in self
            .weights
            .iter_mut()
            .filter(|s| s.spec.trainable && s.spec.regularizer == Regularizer::L2Norm)
        {
            let lambda = T::from_f64(slot.spec.regularizer_constant).unwrap_or_else(T::zero);
            for (g, &w) in slot.grad.data_mut().iter_mut().zip(slot.value.data()) {
                *g += lambda * w;
            }
        }
    }

    // -- scratch tensors --

    fn tensor_slot(&self, h: TensorHandle) -> Result<&TensorSlot<T>> {
        self.tensors.get(h.0).ok_or(LayerError::InvalidHandle {
            kind: "tensor",
            index: h.0,
        })
    }

    fn tensor_slot_mut(&mut self, h: TensorHandle) -> Result<&mut TensorSlot<T>> {
        self.tensors.get_mut(h.0).ok_or(LayerError::InvalidHandle {
            kind: "tensor",
            index: h.0,
        })
    }

    pub fn tensor(&self, h: TensorHandle) -> Result<&Tensor<T, 4>> {
        Ok(&self.tensor_slot(h)?.value)
    }

    pub fn tensor_mut(&mut self, h: TensorHandle) -> Result<&mut Tensor<T, 4>> {
        Ok(&mut self.tensor_slot_mut(h)?.value)
    }

    pub fn tensor_name(&self, h: TensorHandle) -> Result<&str> {
        Ok(&self.tensor_slot(h)?.spec.name)
    }

    pub fn tensor_lifespan(&self, h: TensorHandle) -> Result<Lifespan> {
        Ok(self.tensor_slot(h)?.spec.lifespan)
    }

    /// Overwrites scratch tensor `h`; the shape must match the current allocation exactly.
    pub fn set_tensor(&mut self, h: TensorHandle, t: Tensor<T, 4>) -> Result<()> {
        let slot = self.tensor_slot_mut(h)?;
        check_exact(&slot.spec.dim, t.shape())?;
        slot.value = t;
        Ok(())
    }

    /// Gradient buffer of scratch tensor `h`.
    ///
    /// # Errors
    ///
    /// Returns `LayerError::NoGradient` if the tensor was requested without one.
    pub fn tensor_grad(&self, h: TensorHandle) -> Result<&Tensor<T, 4>> {
        let slot = self.tensor_slot(h)?;
        slot.grad
            .as_ref()
            .ok_or_else(|| LayerError::NoGradient(slot.spec.name.clone()))
    }

    pub fn set_tensor_grad(&mut self, h: TensorHandle, t: Tensor<T, 4>) -> Result<()> {
        let slot = self.tensor_slot_mut(h)?;
        check_exact(&slot.spec.dim, t.shape())?;
        match slot.grad.as_mut() {
            Some(grad) => {
                *grad = t;
                Ok(())
            }
            None => Err(LayerError::NoGradient(slot.spec.name.clone())),
        }
    }

    /// Reallocates scratch tensor `h` (and its gradient) with a new batch extent.
    ///
    /// Contents are zeroed; every other extent is preserved.
    pub fn update_tensor(&mut self, h: TensorHandle, batch: usize) -> Result<()> {
        let slot = self.tensor_slot_mut(h)?;
        slot.spec.dim[0] = batch;
        slot.value = Tensor::zeros(slot.spec.dim);
        if slot.grad.is_some() {
            slot.grad = Some(Tensor::zeros(slot.spec.dim));
        }
        tracing::trace!(tensor = %slot.spec.name, dim = ?slot.spec.dim, "resized scratch tensor");
        Ok(())
    }
}
