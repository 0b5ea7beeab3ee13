//! Last-axis views into an owned tensor.
//!
//! A packed buffer such as `[B, 1, 1, 3K]` holds several logical segments side by side
//! along its last axis. A view addresses one `(offset, len)` segment of every row without
//! copying, so a segment can be read out, transformed, and written back in place.
//!
//! ```rust
//! use mol_attn::tensor::Tensor;
//!
//! let mut packed = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! let middle = packed.view_last_axis(1, 1).unwrap().to_tensor();
//! assert_eq!(middle.data(), &[2.0, 5.0]);
//!
//! let doubled = middle.map(|x| x * 2.0);
//! packed.view_last_axis_mut(1, 1).unwrap().copy_from(&doubled).unwrap();
//! assert_eq!(packed.data(), &[1.0, 4.0, 3.0, 4.0, 10.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError};

/// Read-only view of the columns `[offset, offset + len)` of every last-axis row.
#[derive(Debug)]
pub struct TensorView<'a, T, const RANK: usize>
where
    T: TensorElem,
{
    source: &'a Tensor<T, RANK>,
    offset: usize,
    len: usize,
}

/// Mutable view of the columns `[offset, offset + len)` of every last-axis row.
///
/// Writes go straight into the source tensor.
#[derive(Debug)]
pub struct TensorViewMut<'a, T, const RANK: usize>
where
    T: TensorElem,
{
    source: &'a mut Tensor<T, RANK>,
    offset: usize,
    len: usize,
}

fn check_segment(shape: &[usize], offset: usize, len: usize) -> Result<()> {
    let width = shape.last().copied().unwrap_or(0);
    if offset + len > width {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![offset, offset + len],
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

fn segment_shape<const RANK: usize>(shape: &[usize; RANK], len: usize) -> [usize; RANK] {
    let mut out = *shape;
    out[RANK - 1] = len;
    out
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Borrows the last-axis segment `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if the segment runs past the last axis.
    pub fn view_last_axis(&self, offset: usize, len: usize) -> Result<TensorView<'_, T, RANK>> {
        check_segment(&self.shape, offset, len)?;
        Ok(TensorView {
            source: self,
            offset,
            len,
        })
    }

    /// Mutably borrows the last-axis segment `[offset, offset + len)`.
    pub fn view_last_axis_mut(
        &mut self,
        offset: usize,
        len: usize,
    ) -> Result<TensorViewMut<'_, T, RANK>> {
        check_segment(&self.shape, offset, len)?;
        Ok(TensorViewMut {
            source: self,
            offset,
            len,
        })
    }
}

impl<T, const RANK: usize> TensorView<'_, T, RANK>
where
    T: TensorElem,
{
    /// Shape of the segment: the source shape with the last axis replaced by `len`.
    pub fn shape(&self) -> [usize; RANK] {
        segment_shape(self.source.shape(), self.len)
    }

    /// Copies the segment into a new contiguous tensor.
    pub fn to_tensor(&self) -> Tensor<T, RANK> {
        let width = self.source.shape()[RANK - 1];
        let data = if width == 0 {
            Vec::new()
        } else {
            self.source
                .data()
                .chunks(width)
                .flat_map(|row| row[self.offset..self.offset + self.len].iter().copied())
                .collect()
        };
        let shape = self.shape();
        Tensor {
            shape,
            strides: super::compute_strides(&shape),
            data,
        }
    }
}

impl<T, const RANK: usize> TensorViewMut<'_, T, RANK>
where
    T: TensorElem,
{
    /// Shape of the segment: the source shape with the last axis replaced by `len`.
    pub fn shape(&self) -> [usize; RANK] {
        segment_shape(self.source.shape(), self.len)
    }

    /// Copies the segment into a new contiguous tensor.
    pub fn to_tensor(&self) -> Tensor<T, RANK> {
        TensorView {
            source: &*self.source,
            offset: self.offset,
            len: self.len,
        }
        .to_tensor()
    }

    /// Overwrites the segment with `src`, which must have the segment's shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `src` does not match [`TensorViewMut::shape`].
    pub fn copy_from(&mut self, src: &Tensor<T, RANK>) -> Result<()> {
        let expected = self.shape();
        if src.shape() != &expected {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                got: src.shape().to_vec(),
            });
        }
        if self.len == 0 {
            return Ok(());
        }

        let width = self.source.shape()[RANK - 1];
        let (offset, len) = (self.offset, self.len);
        for (row, src_row) in self
            .source
            .data_mut()
            .chunks_mut(width)
            .zip(src.data().chunks(len))
        {
            row[offset..offset + len].copy_from_slice(src_row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed() -> Tensor<f32, 4> {
        // [B=2, 1, 1, 3K] with K=2
        Tensor::new((0..12).map(|i| i as f32).collect(), [2, 1, 1, 6]).unwrap()
    }

    #[test]
    fn test_view_to_tensor() {
        let t = packed();
        let beta = t.view_last_axis(2, 2).unwrap();
        assert_eq!(beta.shape(), [2, 1, 1, 2]);
        assert_eq!(beta.to_tensor().data(), &[2.0, 3.0, 8.0, 9.0]);
    }

    #[test]
    fn test_view_out_of_range() {
        let t = packed();
        assert!(matches!(
            t.view_last_axis(5, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_copy_from_writes_through() {
        let mut t = packed();
        let replacement = Tensor::new(vec![-1.0, -2.0, -3.0, -4.0], [2, 1, 1, 2]).unwrap();
        t.view_last_axis_mut(4, 2)
            .unwrap()
            .copy_from(&replacement)
            .unwrap();

        assert_eq!(
            t.data(),
            &[0.0, 1.0, 2.0, 3.0, -1.0, -2.0, 6.0, 7.0, 8.0, 9.0, -3.0, -4.0]
        );
    }

    #[test]
    fn test_copy_from_shape_mismatch() {
        let mut t = packed();
        let wrong = Tensor::<f32, 4>::zeros([2, 1, 1, 3]);
        let mut view = t.view_last_axis_mut(0, 2).unwrap();
        assert!(matches!(
            view.copy_from(&wrong),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
