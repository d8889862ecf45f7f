//! Normalization and gated-activation kernels
//!
//! RMSNorm: `output = weight * input / sqrt(mean(input^2) + eps)`
//! SwiGLU: `output = (gate * sigmoid(gate)) * up`
//!
//! Inputs may hold several rows; each `weight.len()` span is normalized
//! independently.

use crate::error::ForgeResult;
use crate::invariant_error;

/// Epsilon added to the mean square before the square root
pub const RMS_NORM_EPS: f32 = 1e-6;

fn check_rows(op: &str, input: usize, weight: usize) -> ForgeResult<()> {
    if weight == 0 || input % weight != 0 {
        return Err(invariant_error!(
            "{}: input of {} elements is not a whole number of {}-element rows",
            op,
            input,
            weight
        ));
    }
    Ok(())
}

#[inline]
fn inv_rms(row: &[f32], eps: f32) -> f32 {
    let mean_square = row.iter().map(|&x| x * x).sum::<f32>() / row.len() as f32;
    1.0 / (mean_square + eps).sqrt()
}

/// RMSNorm from `input` into `output`
pub fn rmsnorm(weight: &[f32], input: &[f32], output: &mut [f32], eps: f32) -> ForgeResult<()> {
    check_rows("rmsnorm", input.len(), weight.len())?;
    if output.len() != input.len() {
        return Err(invariant_error!(
            "rmsnorm: output has {} elements, input has {}",
            output.len(),
            input.len()
        ));
    }
    for (row, out) in input
        .chunks_exact(weight.len())
        .zip(output.chunks_exact_mut(weight.len()))
    {
        let scale = inv_rms(row, eps);
        for ((o, &x), &w) in out.iter_mut().zip(row).zip(weight) {
            *o = w * (x * scale);
        }
    }
    Ok(())
}

/// RMSNorm overwriting `data`
pub fn rmsnorm_in_place(weight: &[f32], data: &mut [f32], eps: f32) -> ForgeResult<()> {
    check_rows("rmsnorm", data.len(), weight.len())?;
    for row in data.chunks_exact_mut(weight.len()) {
        let scale = inv_rms(row, eps);
        for (x, &w) in row.iter_mut().zip(weight) {
            *x = w * (*x * scale);
        }
    }
    Ok(())
}

#[inline]
fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// SwiGLU from `gate` and `up` into `output`
pub fn swiglu(gate: &[f32], up: &[f32], output: &mut [f32]) -> ForgeResult<()> {
    if gate.len() != up.len() || gate.len() != output.len() {
        return Err(invariant_error!(
            "swiglu: gate {} / up {} / output {} lengths differ",
            gate.len(),
            up.len(),
            output.len()
        ));
    }
    for ((o, &g), &u) in output.iter_mut().zip(gate).zip(up) {
        *o = silu(g) * u;
    }
    Ok(())
}

/// SwiGLU accumulated into `gate`
pub fn swiglu_in_place(gate: &mut [f32], up: &[f32]) -> ForgeResult<()> {
    if gate.len() != up.len() {
        return Err(invariant_error!(
            "swiglu: gate {} / up {} lengths differ",
            gate.len(),
            up.len()
        ));
    }
    for (g, &u) in gate.iter_mut().zip(up) {
        *g = silu(*g) * u;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;

    #[test]
    fn test_rmsnorm_reference_vector() {
        let mut out = [0.0; 2];
        rmsnorm(&[1.0, 1.0], &[3.0, 4.0], &mut out, RMS_NORM_EPS).unwrap();
        assert!((out[0] - 0.848_528_1).abs() < 1e-5, "got {}", out[0]);
        assert!((out[1] - 1.131_370_9).abs() < 1e-5, "got {}", out[1]);
    }

    #[test]
    fn test_rmsnorm_unit_mean_square() {
        let input: Vec<f32> = (0..16).map(|i| (i as f32 - 7.5) * 0.3).collect();
        let mut out = vec![0.0; 16];
        rmsnorm(&[1.0; 16], &input, &mut out, RMS_NORM_EPS).unwrap();
        let mean_square = out.iter().map(|x| x * x).sum::<f32>() / 16.0;
        assert!((mean_square - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_rmsnorm_weight_scales() {
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        let weight = vec![0.5f32, 0.5, 0.5, 0.5];
        let mut out = vec![0.0; 4];
        rmsnorm(&weight, &input, &mut out, 1e-5).unwrap();

        // Mean square = (1 + 4 + 9 + 16) / 4 = 7.5
        let expected_scale = 1.0 / (7.5f32 + 1e-5).sqrt();
        for (i, &val) in out.iter().enumerate() {
            let expected = input[i] * expected_scale * weight[i];
            assert!(
                (val - expected).abs() < 1e-4,
                "Element {} mismatch: expected {}, got {}",
                i,
                expected,
                val
            );
        }
    }

    #[test]
    fn test_rmsnorm_in_place_matches() {
        let input = vec![0.2f32, -1.0, 3.5, 0.0, 1.0, 2.0];
        let weight = vec![1.0f32, 0.5, 2.0];
        let mut out = vec![0.0; 6];
        rmsnorm(&weight, &input, &mut out, RMS_NORM_EPS).unwrap();
        let mut data = input.clone();
        rmsnorm_in_place(&weight, &mut data, RMS_NORM_EPS).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_rmsnorm_zeros_stay_zero() {
        let mut data = vec![0.0f32; 8];
        rmsnorm_in_place(&[1.0; 8], &mut data, RMS_NORM_EPS).unwrap();
        assert!(data.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_rmsnorm_shape_checked() {
        let mut out = [0.0; 3];
        assert!(matches!(
            rmsnorm(&[1.0, 1.0], &[1.0, 2.0, 3.0], &mut out, RMS_NORM_EPS),
            Err(ForgeError::ShapeMismatch(_))
        ));
        assert!(rmsnorm(&[1.0], &[1.0, 2.0], &mut out, RMS_NORM_EPS).is_err());
    }

    #[test]
    fn test_swiglu() {
        let gate = [0.0f32, 1.0, -2.0];
        let up = [5.0f32, 2.0, 1.0];
        let mut out = [0.0; 3];
        swiglu(&gate, &up, &mut out).unwrap();
        for i in 0..3 {
            let sigmoid = 1.0 / (1.0 + (-gate[i]).exp());
            let expected = gate[i] * sigmoid * up[i];
            assert!((out[i] - expected).abs() < 1e-6);
        }
        assert_eq!(out[0], 0.0);

        let mut in_place = gate;
        swiglu_in_place(&mut in_place, &up).unwrap();
        assert_eq!(in_place, out);
        assert!(swiglu_in_place(&mut in_place, &up[..2]).is_err());
    }
}
