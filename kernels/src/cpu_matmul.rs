use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU batched matrix multiplication over the last two axes.
///
/// `lhs` is `[batch..., M, K]` and `rhs` is `[batch..., K, N]`. The leading axes of `rhs`
/// must either equal those of `lhs` or all be `1`, in which case the single right-hand
/// matrix is shared by every batch entry (a weight matrix applied to a batch of inputs).
/// The output is `[batch..., M, N]` with the leading axes of `lhs`.
pub fn cpu_matmul<T>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize],
    rhs_shape: &[usize],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rank = lhs_shape.len();
    if rank < 2 {
        return Err(KernelError::RankMismatch {
            expected: 2,
            got: rank,
        });
    }
    if rhs_shape.len() != rank {
        return Err(KernelError::RankMismatch {
            expected: rank,
            got: rhs_shape.len(),
        });
    }

    let m = lhs_shape[rank - 2];
    let k = lhs_shape[rank - 1];
    let n = rhs_shape[rank - 1];

    if k != rhs_shape[rank - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[rank - 2]],
        });
    }

    let lhs_batch = &lhs_shape[..rank - 2];
    let rhs_batch = &rhs_shape[..rank - 2];
    let shared_rhs = if lhs_batch == rhs_batch {
        false
    } else if rhs_batch.iter().all(|&d| d == 1) {
        true
    } else {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    };

    let batch: usize = lhs_batch.iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if out_data.is_empty() {
        return Ok(out_data);
    }

    // Transposing rhs to [..., N, K] makes every dot product walk two contiguous rows.
    let rhs_t_data = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .as_mut_slice()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row_idx, out_row)| {
            let batch_idx = global_row_idx / m;
            let row_in_matrix = global_row_idx % m;

            let a_row_start = batch_idx * m * k + row_in_matrix * k;
            let a_slice = &lhs_data[a_row_start..a_row_start + k];

            let b_t_batch_offset = if shared_rhs { 0 } else { batch_idx * n * k };

            for (col_in_matrix, out_elem) in out_row.iter_mut().enumerate() {
                let b_t_row_start = b_t_batch_offset + col_in_matrix * k;
                let b_t_slice = &rhs_t_data[b_t_row_start..b_t_row_start + k];

                let mut sum = T::zero();
                for (&val_a, &val_b) in a_slice.iter().zip(b_t_slice.iter()) {
                    sum += val_a * val_b;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}
