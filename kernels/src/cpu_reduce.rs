use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Sums `data` along `axis`, keeping the reduced axis with extent 1.
///
/// The tensor is viewed as `[outer, len, inner]` where `len = shape[axis]`; the output is
/// `[outer, 1, inner]` in the same row-major order.
pub fn cpu_sum_axis<T>(data: &[T], shape: &[usize], axis: usize) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if axis >= shape.len() {
        return Err(KernelError::InvalidAxis {
            axis,
            rank: shape.len(),
        });
    }

    let outer: usize = shape[..axis].iter().product();
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();

    let mut out_data = vec![T::zero(); outer * inner];
    if out_data.is_empty() {
        return Ok(out_data);
    }

    out_data
        .par_chunks_mut(inner)
        .enumerate()
        .for_each(|(o, out_block)| {
            let base = o * len * inner;
            for j in 0..len {
                let row = &data[base + j * inner..base + (j + 1) * inner];
                for (acc, &v) in out_block.iter_mut().zip(row.iter()) {
                    *acc += v;
                }
            }
        });

    Ok(out_data)
}
