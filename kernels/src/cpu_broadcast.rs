use crate::{KernelElem, KernelError, Result, row_major_strides};
use rayon::prelude::*;

/// Computes the broadcast shape of two equal-rank shapes.
///
/// Axes are compatible when they are equal or when either side is `1`.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    if lhs.len() != rhs.len() {
        return Err(KernelError::RankMismatch {
            expected: lhs.len(),
            got: rhs.len(),
        });
    }

    lhs.iter()
        .zip(rhs.iter())
        .map(|(&a, &b)| match (a, b) {
            _ if a == b => Ok(a),
            (1, _) => Ok(b),
            (_, 1) => Ok(a),
            _ => Err(KernelError::BroadcastMismatch {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            }),
        })
        .collect()
}

/// Strides of `shape` seen through `target`: broadcast axes get stride 0.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let strides = row_major_strides(shape);
    shape
        .iter()
        .zip(target.iter())
        .zip(strides)
        .map(|((&dim, &t), s)| if dim == 1 && t != 1 { 0 } else { s })
        .collect()
}

/// Maps a flat output index to the flat source index under `src_strides`.
#[inline]
fn source_index(mut linear: usize, out_strides: &[usize], src_strides: &[usize]) -> usize {
    let mut idx = 0;
    for (&os, &ss) in out_strides.iter().zip(src_strides.iter()) {
        let coord = linear / os;
        linear %= os;
        idx += coord * ss;
    }
    idx
}

/// Applies `op` element-wise over two broadcast-compatible operands.
///
/// Returns the output data together with its (broadcast) shape.
pub fn cpu_broadcast_binary<T, F>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize],
    rhs_shape: &[usize],
    op: F,
) -> Result<(Vec<T>, Vec<usize>)>
where
    T: KernelElem,
    F: Fn(T, T) -> T + Sync + Send,
{
    let out_shape = broadcast_shape(lhs_shape, rhs_shape)?;
    let size: usize = out_shape.iter().product();
    let mut out_data = vec![T::zero(); size];

    if lhs_shape == rhs_shape {
        out_data
            .par_iter_mut()
            .zip(lhs_data.par_iter())
            .zip(rhs_data.par_iter())
            .for_each(|((o, &a), &b)| *o = op(a, b));
        return Ok((out_data, out_shape));
    }

    let out_strides = row_major_strides(&out_shape);
    let lhs_strides = broadcast_strides(lhs_shape, &out_shape);
    let rhs_strides = broadcast_strides(rhs_shape, &out_shape);

    out_data.par_iter_mut().enumerate().for_each(|(i, o)| {
        let a = lhs_data[source_index(i, &out_strides, &lhs_strides)];
        let b = rhs_data[source_index(i, &out_strides, &rhs_strides)];
        *o = op(a, b);
    });

    Ok((out_data, out_shape))
}

/// Materializes `data` broadcast to `target`.
pub fn cpu_expand<T>(data: &[T], shape: &[usize], target: &[usize]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let out_shape = broadcast_shape(shape, target)?;
    if out_shape != target {
        return Err(KernelError::BroadcastMismatch {
            lhs: shape.to_vec(),
            rhs: target.to_vec(),
        });
    }

    let size: usize = target.iter().product();
    let out_strides = row_major_strides(target);
    let src_strides = broadcast_strides(shape, target);

    let mut out_data = vec![T::zero(); size];
    out_data.par_iter_mut().enumerate().for_each(|(i, o)| {
        *o = data[source_index(i, &out_strides, &src_strides)];
    });
    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[2, 1, 3], &[1, 4, 3]).unwrap(), vec![2, 4, 3]);
        assert_eq!(broadcast_shape(&[5, 2], &[5, 2]).unwrap(), vec![5, 2]);

        let err = broadcast_shape(&[2, 3], &[3, 3]);
        assert!(matches!(err, Err(KernelError::BroadcastMismatch { .. })));

        let err = broadcast_shape(&[2, 3], &[2, 3, 1]);
        assert!(matches!(err, Err(KernelError::RankMismatch { .. })));
    }

    #[test]
    fn test_binary_same_shape() {
        let (out, shape) =
            cpu_broadcast_binary(&[1.0, 2.0], &[3.0, 4.0], &[2], &[2], |a, b| a + b).unwrap();
        assert_eq!(shape, vec![2]);
        assert_eq!(out, vec![4.0, 6.0]);
    }

    #[test]
    fn test_binary_two_sided_broadcast() {
        // Column [2, 1] minus row [1, 3]
        let col = [10.0, 20.0];
        let row = [1.0, 2.0, 3.0];
        let (out, shape) = cpu_broadcast_binary(&col, &row, &[2, 1], &[1, 3], |a, b| a - b).unwrap();
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(out, vec![9.0, 8.0, 7.0, 19.0, 18.0, 17.0]);
    }

    #[test]
    fn test_expand() {
        let out = cpu_expand(&[1.0, 2.0], &[2, 1], &[2, 3]).unwrap();
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

        // Expanding cannot shrink an axis.
        let err = cpu_expand(&[1.0, 2.0], &[1, 2], &[1, 1]);
        assert!(err.is_err());
    }
}
