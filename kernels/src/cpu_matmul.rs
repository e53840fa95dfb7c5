use crate::{KernelElem, Result};
use rayon::prelude::*;

/// Batched matrix multiplication over flat buffers.
///
/// `lhs` is laid out as `[batch, m, k]` and `rhs` as `[batch, k, n]`; the result is
/// `[batch, m, n]`. Any of the sizes may be 1, which is how outer products (`k == 1`) and full
/// reductions (`m == n == 1`) reach this kernel.
///
/// The right-hand side is transposed once up front so the inner dot product walks both operands
/// sequentially.
pub fn cpu_matmul<T>(
    lhs: &[T],
    rhs: &[T],
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if lhs.len() != batch * m * k {
        return Err(crate::KernelError::ShapeMismatch {
            expected: vec![batch, m, k],
            got: vec![lhs.len()],
        });
    }
    if rhs.len() != batch * k * n {
        return Err(crate::KernelError::ShapeMismatch {
            expected: vec![batch, k, n],
            got: vec![rhs.len()],
        });
    }

    let mut out = vec![T::zero(); batch * m * n];
    if out.is_empty() {
        return Ok(out);
    }

    // [batch, k, n] -> [batch, n, k]
    let rhs_t = crate::cpu_permute(rhs, &[batch, k, n], &[0, 2, 1])?;

    out.par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row, out_row)| {
            let b = global_row / m;
            let row = global_row % m;
            let a_start = b * m * k + row * k;
            let a_slice = &lhs[a_start..a_start + k];

            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b_start = b * n * k + col * k;
                let b_slice = &rhs_t[b_start..b_start + k];

                let mut sum = T::zero();
                for (&val_a, &val_b) in a_slice.iter().zip(b_slice.iter()) {
                    sum += val_a * val_b;
                }
                *out_elem = sum;
            }
        });

    Ok(out)
}
