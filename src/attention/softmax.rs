//! Numerically stable softmax

/// Softmax in place: subtract the max, exponentiate, normalize by the sum
pub fn softmax_in_place(data: &mut [f32]) {
    if data.is_empty() {
        return;
    }
    let max_val = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0f32;
    for x in data.iter_mut() {
        *x = (*x - max_val).exp();
        sum += *x;
    }
    let inv_sum = if sum > 0.0 { 1.0 / sum } else { 1.0 };
    for x in data.iter_mut() {
        *x *= inv_sum;
    }
}

/// Softmax into a new vector
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let mut out = logits.to_vec();
    softmax_in_place(&mut out);
    out
}
