//! Core Tensor implementation.
//!
//! # What is a Tensor?
//!
//! A **Tensor** is a multi-dimensional array. Every buffer the attention layer touches
//! (inputs, weights, scratch buffers, gradients) is one.
//!
//! In `mol-attn`, a `Tensor` is defined by:
//! 1. **Data**: A flat vector of elements (`f32` or `f64`).
//! 2. **Shape**: An array of dimensions whose length is the compile-time `RANK`.
//! 3. **Strides**: How to step through the flat data to traverse dimensions.
//!
//! Layer buffers are rank 4 and follow the `[batch, channel, height, width]` convention,
//! so a batch of query vectors is `[B, 1, 1, D]` and a value sequence is `[B, 1, L, D]`.
//!
//! ## Example
//!
//! ```rust
//! use mol_attn::tensor::Tensor;
//!
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f32, 2>::new(data, [2, 3]).unwrap();
//!
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```
//!
//! > [!TIP]
//! > **Strides and Memory Layout**
//! > Tensors are **Row-Major** (C-style): the last dimension changes the fastest in memory.
//! > Last-axis views ([`TensorView`]) rely on this to address a column range of every row.

use mol_attn_kernels::KernelError;
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;
pub mod view;

pub use view::{TensorView, TensorViewMut};

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Two operands cannot be broadcast against each other.
    #[error("Incompatible shapes for broadcasting: {0:?} and {1:?}")]
    BroadcastError(Vec<usize>, Vec<usize>),
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// A reduction axis does not exist.
    #[error("Axis {axis} is out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },
    /// The requested operation is not supported (e.g., for a specific rank).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<KernelError> for TensorError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::BroadcastMismatch { lhs, rhs } => TensorError::BroadcastError(lhs, rhs),
            KernelError::RankMismatch { expected, got } => TensorError::ShapeMismatch {
                expected: vec![expected],
                got: vec![got],
            },
            KernelError::InvalidAxis { axis, rank } => TensorError::InvalidAxis { axis, rank },
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Elements live in a contiguous `Vec<T>`.
/// - `Num + ...`: Numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// The core Tensor struct.
///
/// Represents an N-dimensional, row-major array of elements that owns its storage.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
///
/// The rank is fixed at compile time while the extents are runtime values, so the same
/// layer can run with any batch size or sequence length. Shape mismatches are reported as
/// [`TensorError`] values rather than type errors.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// The number of elements must remain the same; the data is not copied.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the element at a multi-dimensional index.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if any coordinate exceeds its extent.
    pub fn get(&self, index: [usize; RANK]) -> Result<T> {
        if index.iter().zip(self.shape.iter()).any(|(&i, &d)| i >= d) {
            return Err(TensorError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.to_vec(),
            });
        }
        let offset: usize = index
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &s)| i * s)
            .sum();
        Ok(self.data[offset])
    }
}

/// Computes the row-major strides for a given shape.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}
