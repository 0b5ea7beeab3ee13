//! CPU kernels backing the `mol-attn` tensor type.
//!
//! Every kernel works on flat row-major slices plus an explicit shape, so the
//! tensor crate can swap them out without touching layer code.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_broadcast;
pub mod cpu_matmul;
pub mod cpu_reduce;
pub mod cpu_transpose;

pub use cpu_broadcast::{broadcast_shape, cpu_broadcast_binary, cpu_expand};
pub use cpu_matmul::cpu_matmul;
pub use cpu_reduce::cpu_sum_axis;
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Shapes {lhs:?} and {rhs:?} cannot be broadcast together")]
    BroadcastMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("Rank mismatch: expected {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },
    #[error("Axis {axis} is out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Row-major strides for `shape`.
pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}
