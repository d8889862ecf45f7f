//! Matrix multiplication kernels
//!
//! Weights are stored row-major as `[out_dim, in_dim]`. Inputs are a single
//! column vector (`[in_dim]`) or a row-major `[in_dim, batch]` matrix whose
//! columns are independent vectors.

use crate::error::ForgeResult;
use crate::invariant_error;

/// `output = scale * (weight · input)`
///
/// Arguments:
/// - weight: `[out_dim, in_dim]` row-major
/// - input: `[in_dim, batch]` row-major (`batch == 1` for a vector)
/// - output: `[out_dim, batch]` row-major
pub fn matmul(
    weight: &[f32],
    out_dim: usize,
    in_dim: usize,
    input: &[f32],
    batch: usize,
    output: &mut [f32],
    scale: f32,
) -> ForgeResult<()> {
    if weight.len() != out_dim * in_dim {
        return Err(invariant_error!(
            "matmul: weight has {} elements, expected {}x{}",
            weight.len(),
            out_dim,
            in_dim
        ));
    }
    if input.len() != in_dim * batch {
        return Err(invariant_error!(
            "matmul: input has {} elements, expected {}x{}",
            input.len(),
            in_dim,
            batch
        ));
    }
    if output.len() != out_dim * batch {
        return Err(invariant_error!(
            "matmul: output has {} elements, expected {}x{}",
            output.len(),
            out_dim,
            batch
        ));
    }

    if batch == 1 {
        for (out, row) in output.iter_mut().zip(weight.chunks_exact(in_dim.max(1))) {
            *out = scale * dot(row, input);
        }
        return Ok(());
    }

    for o in 0..out_dim {
        let row = &weight[o * in_dim..(o + 1) * in_dim];
        for b in 0..batch {
            let mut sum = 0.0f32;
            for (i, &w) in row.iter().enumerate() {
                sum += w * input[i * batch + b];
            }
            output[o * batch + b] = scale * sum;
        }
    }
    Ok(())
}

/// Elementwise `out = a + b`
pub fn matadd(a: &[f32], b: &[f32], out: &mut [f32]) -> ForgeResult<()> {
    if a.len() != b.len() || a.len() != out.len() {
        return Err(invariant_error!(
            "matadd: lengths {} + {} -> {}",
            a.len(),
            b.len(),
            out.len()
        ));
    }
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x + y;
    }
    Ok(())
}

/// Elementwise `acc += other`
pub fn matadd_assign(acc: &mut [f32], other: &[f32]) -> ForgeResult<()> {
    if acc.len() != other.len() {
        return Err(invariant_error!(
            "matadd: lengths {} += {}",
            acc.len(),
            other.len()
        ));
    }
    for (a, &b) in acc.iter_mut().zip(other) {
        *a += b;
    }
    Ok(())
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// Reference matrix multiplication for testing
/// Simple O(m*n*k) implementation for validation
pub fn cpu_matmul_f32(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = sum;
        }
    }

    c
}
