//! # mol-attn
//!
//! `mol-attn` is a pure Rust implementation of **Mixture-of-Logistics attention**, the
//! location-sensitive attention unit used for monotonic alignment in sequence-to-sequence
//! speech models, together with its hand-derived backward pass.
//!
//! It runs on **CPU only**; data parallelism inside the kernels comes from `rayon`.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Rank-generic owned tensors with broadcasting, matmul and last-axis views.
//! - [`nn`]: The resource registry, activations and the [`MolAttention`](nn::MolAttention) layer.
//!
//! ## Example
//!
//! ```rust
//! use mol_attn::nn::context::InitContext;
//! use mol_attn::nn::{Layer, MolAttention};
//! use mol_attn::tensor::Tensor;
//!
//! let mut layer = MolAttention::<f64>::new();
//! layer.set_property(&["unit=8", "mol_k=2"]).unwrap();
//!
//! let mut init = InitContext::new("attn", vec![[1, 1, 1, 4], [1, 1, 5, 3], [1, 1, 1, 2]]);
//! layer.finalize(&mut init).unwrap();
//! let mut ctx = init.build::<f64>(42);
//! let slots = *layer.slots().unwrap();
//!
//! ctx.set_input(slots.value, Tensor::ones([1, 1, 5, 3])).unwrap();
//! layer.forward(&mut ctx, true).unwrap();
//!
//! ctx.set_incoming_derivative(0, Tensor::ones([1, 1, 1, 3])).unwrap();
//! layer.calc_gradient(&mut ctx).unwrap();
//! layer.calc_derivative(&mut ctx).unwrap();
//! assert_eq!(layer.helper_runs(), 1);
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use mol_attn::tensor;
///
/// // A [B=1, 1, 1, K=2] recurrent state.
/// let state = tensor!([0.0, 0.0], [1, 1, 1, 2]);
/// assert_eq!(state.shape(), &[1, 1, 1, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [1, 1, 1, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < SHAPE.len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Length checked at compile time above.
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod nn;
pub mod tensor;

pub use nn::{Layer, LayerError, MolAttention, MolAttentionProps};
pub use tensor::{Tensor, TensorElem, TensorError};
