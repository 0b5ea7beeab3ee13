//! Activation Functions.
//!
//! # What is an Activation Function?
//!
//! Activation functions introduce **non-linearity** into neural networks. Without them, a stack of
//! projections (no matter how deep) collapses into a single linear transformation.
//!
//! The attention layer uses three:
//! - **Tanh**: $\tanh(x)$. Squashes the hidden projection into $(-1, 1)$.
//! - **Sigmoid**: $\sigma(x) = 1 / (1 + e^{-x})$. The logistic CDF, evaluated at bin edges.
//! - **Softmax**: $e^{x_i} / \sum_j e^{x_j}$ over the last axis. Turns logits into mixture weights.
//!
//! # Backward from Outputs
//!
//! All three derivatives can be written in terms of the forward **output** `y` alone:
//!
//! | Activation | $\partial L / \partial x$ |
//! |------------|---------------------------|
//! | Tanh       | $dy \cdot (1 - y^2)$ |
//! | Sigmoid    | $dy \cdot y (1 - y)$ |
//! | Softmax    | $y \odot (dy - \sum_j y_j\, dy_j)$ |
//!
//! > [!TIP]
//! > This is why the layer caches activation outputs (`fc_tanh`, `prob_left`, ...) instead of
//! > their inputs: the backward pass never has to re-evaluate a transcendental function.

use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rayon::prelude::*;

/// Computes the logistic sigmoid $\sigma(x) = 1 / (1 + e^{-x})$.
pub fn sigmoid<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// Element-wise or row-wise activation functions with output-based derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    Sigmoid,
    /// Softmax over the last axis.
    Softmax,
}

impl Activation {
    /// Applies the activation to `x`.
    pub fn forward<T, const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Tensor<T, RANK>
    where
        T: TensorElem + Float,
    {
        match self {
            Activation::Tanh => x.map(Float::tanh),
            Activation::Sigmoid => x.map(sigmoid),
            Activation::Softmax => {
                let mut out = x.clone();
                let width = x.shape()[RANK - 1];
                if width == 0 {
                    return out;
                }
                out.data_mut().par_chunks_mut(width).for_each(|row| {
                    let max = row.iter().copied().fold(T::neg_infinity(), T::max);
                    let mut sum = T::zero();
                    for v in row.iter_mut() {
                        *v = (*v - max).exp();
                        sum += *v;
                    }
                    for v in row.iter_mut() {
                        *v /= sum;
                    }
                });
                out
            }
        }
    }

    /// Propagates `dy` back through the activation, given its forward output `y`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `y` and `dy` differ in shape.
    pub fn backward<T, const RANK: usize>(
        &self,
        y: &Tensor<T, RANK>,
        dy: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>>
    where
        T: TensorElem + Float,
    {
        if y.shape() != dy.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: y.shape().to_vec(),
                got: dy.shape().to_vec(),
            });
        }

        let mut dx = Tensor::zeros(*y.shape());
        match self {
            Activation::Tanh => dx
                .data_mut()
                .par_iter_mut()
                .zip(y.data().par_iter().zip(dy.data().par_iter()))
                .for_each(|(o, (&y, &g))| *o = g * (T::one() - y * y)),
            Activation::Sigmoid => dx
                .data_mut()
                .par_iter_mut()
                .zip(y.data().par_iter().zip(dy.data().par_iter()))
                .for_each(|(o, (&y, &g))| *o = g * y * (T::one() - y)),
            Activation::Softmax => {
                let width = y.shape()[RANK - 1];
                if width == 0 {
                    return Ok(dx);
                }
                dx.data_mut()
                    .par_chunks_mut(width)
                    .zip(y.data().par_chunks(width).zip(dy.data().par_chunks(width)))
                    .for_each(|(out, (y_row, g_row))| {
                        let dot = y_row
                            .iter()
                            .zip(g_row.iter())
                            .fold(T::zero(), |acc, (&y, &g)| acc + y * g);
                        for ((o, &y), &g) in out.iter_mut().zip(y_row).zip(g_row) {
                            *o = y * (g - dot);
                        }
                    });
            }
        }
        Ok(dx)
    }
}
