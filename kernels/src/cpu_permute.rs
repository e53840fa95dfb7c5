use crate::{row_major_strides, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Reorders the axes of a row-major buffer.
///
/// Output axis `i` is input axis `perm[i]`, so the output shape is
/// `[shape[perm[0]], shape[perm[1]], ...]`.
pub fn cpu_permute<T>(data: &[T], shape: &[usize], perm: &[usize]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rank = shape.len();
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| p >= rank || std::mem::replace(&mut seen[p], true))
    {
        return Err(KernelError::InvalidPermutation {
            perm: perm.to_vec(),
            rank,
        });
    }

    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data.len()],
        });
    }

    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        return Ok(data.to_vec());
    }

    let in_strides = row_major_strides(shape);
    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
    // Input stride seen from each output axis.
    let gathered: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();

    let inner = out_shape.last().copied().unwrap_or(1).max(1);
    let inner_stride = gathered.last().copied().unwrap_or(0);
    let outer_shape = &out_shape[..rank.saturating_sub(1)];
    let outer_strides = &gathered[..rank.saturating_sub(1)];

    let mut out = vec![T::zero(); size];
    out.par_chunks_mut(inner)
        .enumerate()
        .for_each(|(row, out_row)| {
            let mut rem = row;
            let mut base = 0;
            for axis in (0..outer_shape.len()).rev() {
                let extent = outer_shape[axis];
                base += (rem % extent) * outer_strides[axis];
                rem /= extent;
            }
            for (j, elem) in out_row.iter_mut().enumerate() {
                *elem = data[base + j * inner_stride];
            }
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_matrix_transpose() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let result = cpu_permute(&data, &[2, 3], &[1, 0]).unwrap();
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_permute_batch_transpose() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = cpu_permute(&data, &[2, 2, 2], &[0, 2, 1]).unwrap();
        assert_eq!(result, vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0]);
    }

    #[test]
    fn test_permute_rank3_rotation() {
        // [1, 2, 3] -> axes (2, 0, 1) -> [3, 1, 2]
        let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let result = cpu_permute(&data, &[1, 2, 3], &[2, 0, 1]).unwrap();
        assert_eq!(result, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_permute_identity_and_scalar() {
        let data = vec![7.0f32];
        assert_eq!(cpu_permute(&data, &[], &[]).unwrap(), vec![7.0]);
        let data = vec![1.0f32, 2.0];
        assert_eq!(cpu_permute(&data, &[2], &[0]).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_permute_rejects_bad_perm() {
        let data = vec![1.0f32; 4];
        assert!(matches!(
            cpu_permute(&data, &[2, 2], &[0, 0]),
            Err(KernelError::InvalidPermutation { .. })
        ));
    }
}
