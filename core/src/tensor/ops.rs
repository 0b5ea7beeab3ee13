//! Tensor operations.
//!
//! # Overview
//!
//! This module implements the mathematical engine used by the attention layer:
//! - **Element-wise Arithmetic**: `+`, `-`, `*`, `/` with broadcasting.
//! - **Matrix Multiplication**: batched matmul, optionally against one shared matrix,
//!   plus its two partial derivatives.
//! - **Reductions**: sums over any set of axes, keeping reduced axes.
//!
//! # Broadcasting
//!
//! Operands must have the same rank. Two dimensions are compatible if they are equal or
//! one of them is 1; the output takes the larger extent. A `[1, 1, L, K]` position grid
//! minus `[B, 1, 1, K]` mixture centers therefore yields `[B, 1, L, K]`.
//!
//! # Parallelism
//!
//! > [!TIP]
//! > All kernels run on `rayon`. For the small buffers of a single attention step the
//! > thread pool overhead can dominate; the layer's cost is dominated by the `[B, 1, L, K]`
//! > mixture buffers when `L` is large.
//!
//! # Examples
//!
//! ```rust
//! use mol_attn::tensor::Tensor;
//!
//! let col = Tensor::<f32, 2>::new(vec![1.0, 2.0], [2, 1]).unwrap();
//! let row = Tensor::<f32, 2>::new(vec![10.0, 20.0, 30.0], [1, 3]).unwrap();
//!
//! let sum = (&col + &row).unwrap();
//! assert_eq!(sum.shape(), &[2, 3]);
//! assert_eq!(sum.data(), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
//! ```

use super::{compute_strides, Result, Tensor, TensorElem, TensorError};

use num_traits::Float;
use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a broadcasting binary arithmetic trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// # Arguments
///
/// * `$trait` - The trait to implement (e.g., `Add`).
/// * `$method` - The method name of the trait (e.g., `add`).
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                let (data, shape) = mol_attn_kernels::cpu_broadcast_binary(
                    &self.data,
                    &rhs.data,
                    &self.shape,
                    &rhs.shape,
                    |a: T, b: T| a.$method(b),
                )?;
                let shape: [usize; RANK] =
                    shape
                        .try_into()
                        .map_err(|got: Vec<usize>| TensorError::ShapeMismatch {
                            expected: self.shape.to_vec(),
                            got,
                        })?;
                Tensor::new(data, shape)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mol_attn::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Applies a function element-wise in place.
    pub fn apply_inplace<F>(&mut self, f: F)
    where
        F: Fn(T) -> T + Sync + Send,
    {
        self.data.par_iter_mut().for_each(|x| *x = f(*x));
    }

    /// Returns the element-wise negation.
    pub fn neg(&self) -> Self {
        self.map(|x| T::zero() - x)
    }

    /// Materializes this tensor broadcast to `shape`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::BroadcastError` if an axis of `self` is neither `1` nor equal to
    /// the target extent.
    pub fn broadcast_to(&self, shape: [usize; RANK]) -> Result<Self> {
        let data = mol_attn_kernels::cpu_expand(&self.data, &self.shape, &shape)?;
        Tensor::new(data, shape)
    }

    /// Sums over each axis in `axes`, keeping every reduced axis with extent 1.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mol_attn::tensor::Tensor;
    /// let t = Tensor::<f32, 3>::new(vec![1.0, 2.0, 3.0, 4.0], [1, 2, 2]).unwrap();
    /// let s = t.sum_axes(&[1]).unwrap();
    /// assert_eq!(s.shape(), &[1, 1, 2]);
    /// assert_eq!(s.data(), &[4.0, 6.0]);
    /// ```
    pub fn sum_axes(&self, axes: &[usize]) -> Result<Self> {
        let mut shape = self.shape;
        let mut data = self.data.clone();
        for &axis in axes {
            if axis >= RANK {
                return Err(TensorError::InvalidAxis { axis, rank: RANK });
            }
            data = mol_attn_kernels::cpu_sum_axis(&data, &shape, axis)?;
            shape[axis] = 1;
        }
        Tensor::new(data, shape)
    }

    /// Batched Matrix Multiplication over the last two axes.
    ///
    /// - `[..., M, K] x [..., K, N] -> [..., M, N]` when the leading axes match.
    /// - `[..., M, K] x [1, ..., 1, K, N] -> [..., M, N]`: a single right-hand matrix shared
    ///   by every batch entry, which is how a weight matrix is applied to a batch.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the contracted axes or leading axes disagree.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        let data = mol_attn_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(data, out_shape)
    }

    /// Transposes the last two axes.
    pub fn transpose(&self) -> Result<Self> {
        const { assert!(RANK >= 2, "Transpose requires rank >= 2") };

        let data = mol_attn_kernels::cpu_transpose(&self.data, &self.shape)?;
        let mut new_shape = self.shape;
        new_shape.swap(RANK - 1, RANK - 2);
        Tensor::new(data, new_shape)
    }

    /// Gradient of `lhs.matmul(rhs)` with respect to `lhs`.
    ///
    /// `dL/dlhs = dL/dout · rhsᵀ`, with the same sharing rules as [`Tensor::matmul`].
    pub fn matmul_grad_lhs(d_out: &Self, rhs: &Self) -> Result<Self> {
        d_out.matmul(&rhs.transpose()?)
    }

    /// Gradient of `lhs.matmul(rhs)` with respect to `rhs`.
    ///
    /// `dL/drhs = lhsᵀ · dL/dout`. When `rhs_shape` has all-one leading axes (a shared
    /// matrix) the per-batch contributions are summed into one `[1, ..., 1, K, N]` result.
    pub fn matmul_grad_rhs(lhs: &Self, d_out: &Self, rhs_shape: [usize; RANK]) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        let m = lhs.shape[RANK - 2];
        let k = lhs.shape[RANK - 1];
        let n = d_out.shape[RANK - 1];
        if d_out.shape[..RANK - 1] != lhs.shape[..RANK - 1] {
            return Err(TensorError::ShapeMismatch {
                expected: lhs.shape[..RANK - 1].to_vec(),
                got: d_out.shape[..RANK - 1].to_vec(),
            });
        }
        if rhs_shape[RANK - 2] != k || rhs_shape[RANK - 1] != n {
            return Err(TensorError::ShapeMismatch {
                expected: vec![k, n],
                got: rhs_shape[RANK - 2..].to_vec(),
            });
        }

        if rhs_shape[..RANK - 2] == lhs.shape[..RANK - 2] {
            return lhs.transpose()?.matmul(d_out);
        }
        if rhs_shape[..RANK - 2].iter().any(|&d| d != 1) {
            return Err(TensorError::ShapeMismatch {
                expected: lhs.shape.to_vec(),
                got: rhs_shape.to_vec(),
            });
        }

        // Flatten the batch into the contracted axis: [rows, K]ᵀ · [rows, N] = [K, N].
        let rows = lhs.size() / k.max(1);
        debug_assert_eq!(rows, lhs.shape[..RANK - 2].iter().product::<usize>() * m);
        let lhs_t = mol_attn_kernels::cpu_transpose(&lhs.data, &[rows, k])?;
        let data = mol_attn_kernels::cpu_matmul(&lhs_t, &d_out.data, &[k, rows], &[rows, n])?;
        Tensor::new(data, rhs_shape)
    }
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem + Float,
{
    /// Returns `true` if no element is NaN or infinite.
    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

/// Builds a `[1, 1, len, width]` tensor whose row `h` holds `f(h)` in every column.
pub fn row_grid<T, F>(len: usize, width: usize, f: F) -> Tensor<T, 4>
where
    T: TensorElem,
    F: Fn(usize) -> T,
{
    let mut data = Vec::with_capacity(len * width);
    for h in 0..len {
        let v = f(h);
        data.extend(std::iter::repeat_n(v, width));
    }
    let shape = [1, 1, len, width];
    Tensor {
        shape,
        strides: compute_strides(&shape),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_same_shape() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b - &a).unwrap().data(), &[2.0, 2.0]);
        assert_eq!((&b / &a).unwrap().data(), &[3.0, 2.0]);
    }

    #[test]
    fn test_arithmetic_broadcast() {
        // [B=2, 1, 1, K=2] centers against a [1, 1, L=3, K=2] grid
        let grid = row_grid::<f32, _>(3, 2, |h| (h + 1) as f32);
        let centers = Tensor::<f32, 4>::new(vec![0.0, 1.0, 2.0, 3.0], [2, 1, 1, 2]).unwrap();

        let diff = (&grid - &centers).unwrap();
        assert_eq!(diff.shape(), &[2, 1, 3, 2]);
        assert_eq!(
            diff.data(),
            &[1.0, 0.0, 2.0, 1.0, 3.0, 2.0, -1.0, -2.0, 0.0, -1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_arithmetic_broadcast_error() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        assert!(matches!(&a + &b, Err(TensorError::BroadcastError(_, _))));
    }

    #[test]
    fn test_sum_axes_multiple() {
        let t = Tensor::<f32, 4>::new((1..=8).map(|i| i as f32).collect(), [2, 1, 2, 2]).unwrap();
        let s = t.sum_axes(&[0, 1, 2]).unwrap();
        assert_eq!(s.shape(), &[1, 1, 1, 2]);
        // column 0: 1 + 3 + 5 + 7, column 1: 2 + 4 + 6 + 8
        assert_eq!(s.data(), &[16.0, 20.0]);

        assert!(matches!(
            t.sum_axes(&[4]),
            Err(TensorError::InvalidAxis { axis: 4, rank: 4 })
        ));
    }

    #[test]
    fn test_broadcast_to() {
        let col = Tensor::<f32, 4>::new(vec![1.0, 2.0], [1, 1, 2, 1]).unwrap();
        let wide = col.broadcast_to([1, 1, 2, 3]).unwrap();
        assert_eq!(wide.data(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(col.broadcast_to([1, 1, 3, 3]).is_err());
    }

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![7.0, 8.0, 9.0, 1.0, 2.0, 3.0], [3, 2]).unwrap();

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[31.0, 19.0, 85.0, 55.0]);
    }

    #[test]
    fn test_matmul_shared_weight() {
        let x = Tensor::<f32, 4>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 1, 2]).unwrap();
        let w = Tensor::<f32, 4>::new(vec![1.0, 0.0, 1.0, 1.0, 1.0, 2.0], [1, 1, 2, 3]).unwrap();

        let y = x.matmul(&w).unwrap();
        assert_eq!(y.shape(), &[2, 1, 1, 3]);
        assert_eq!(y.data(), &[3.0, 2.0, 5.0, 7.0, 4.0, 11.0]);
    }

    #[test]
    fn test_matmul_grads_shared_weight() {
        // y = x · w with w shared across the batch.
        let x = Tensor::<f64, 4>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 1, 2]).unwrap();
        let w = Tensor::<f64, 4>::new(vec![1.0, 0.0, 1.0, 1.0, 1.0, 2.0], [1, 1, 2, 3]).unwrap();
        let dy = Tensor::<f64, 4>::ones([2, 1, 1, 3]);

        let dx = Tensor::matmul_grad_lhs(&dy, &w).unwrap();
        assert_eq!(dx.shape(), &[2, 1, 1, 2]);
        // Row sums of w: [2, 4]
        assert_eq!(dx.data(), &[2.0, 4.0, 2.0, 4.0]);

        let dw = Tensor::matmul_grad_rhs(&x, &dy, *w.shape()).unwrap();
        assert_eq!(dw.shape(), &[1, 1, 2, 3]);
        // Column sums of x over the batch: [4, 6]
        assert_eq!(dw.data(), &[4.0, 4.0, 4.0, 6.0, 6.0, 6.0]);
    }

    #[test]
    fn test_matmul_grads_batched() {
        // scores [B, 1, 1, L] x value [B, 1, L, D]
        let s = Tensor::<f64, 4>::new(vec![1.0, 2.0], [1, 1, 1, 2]).unwrap();
        let v = Tensor::<f64, 4>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [1, 1, 2, 3]).unwrap();
        let dy = Tensor::<f64, 4>::new(vec![1.0, 0.0, -1.0], [1, 1, 1, 3]).unwrap();

        let ds = Tensor::matmul_grad_lhs(&dy, &v).unwrap();
        assert_eq!(ds.data(), &[-2.0, -2.0]);

        let dv = Tensor::matmul_grad_rhs(&s, &dy, *v.shape()).unwrap();
        assert_eq!(dv.data(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        let t_t = t.transpose().unwrap();
        assert_eq!(t_t.shape(), &[3, 2]);
        assert_eq!(t_t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_map_neg_finite() {
        let mut t = Tensor::<f64, 1>::new(vec![0.0, 1.0], [2]).unwrap();
        assert_eq!(t.map(f64::exp).data(), &[1.0, std::f64::consts::E]);
        assert_eq!(t.neg().data(), &[0.0, -1.0]);

        t.apply_inplace(|x| x / 0.0);
        assert!(!t.all_finite());
    }
}
