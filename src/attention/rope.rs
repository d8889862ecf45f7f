//! Rotary Positional Embeddings (RoPE)
//!
//! The rotation tables are read from the weight file as two
//! `[context_length, head_size / 2]` caches. Within a head of `head_size`
//! elements, element `g` is paired with element `g + head_size / 2` and the
//! pair is rotated by the angle whose cos/sin sit at `[pos, g]`.

use crate::error::ForgeResult;
use crate::invariant_error;

/// Parameters for building rotation tables
#[derive(Debug, Clone)]
pub struct RopeConfig {
    /// Dimension of each head
    pub head_size: usize,
    /// Number of positions in the tables
    pub context_length: usize,
    /// Base frequency for rotary embeddings
    pub base: f32,
}

impl RopeConfig {
    pub fn new(head_size: usize, context_length: usize) -> Self {
        Self {
            head_size,
            context_length,
            base: 1_000_000.0,
        }
    }

    pub fn with_base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    /// Compute `(cos, sin)` tables of shape `[context_length, head_size / 2]`
    pub fn tables(&self) -> ForgeResult<(Vec<f32>, Vec<f32>)> {
        if self.head_size % 2 != 0 {
            return Err(invariant_error!(
                "rope: head size must be even, got {}",
                self.head_size
            ));
        }
        let half = self.head_size / 2;
        let mut cos = vec![0.0f32; self.context_length * half];
        let mut sin = vec![0.0f32; self.context_length * half];

        for pos in 0..self.context_length {
            for i in 0..half {
                let idx = pos * half + i;
                let freq = pos as f32 / self.base.powf(2.0 * i as f32 / self.head_size as f32);
                cos[idx] = freq.cos();
                sin[idx] = freq.sin();
            }
        }
        Ok((cos, sin))
    }
}

/// Rotate every head of `x` in place using the table rows for one position
pub fn rotate_heads(x: &mut [f32], head_size: usize, cos_row: &[f32], sin_row: &[f32]) -> ForgeResult<()> {
    let half = head_size / 2;
    if head_size == 0 || head_size % 2 != 0 || x.len() % head_size != 0 {
        return Err(invariant_error!(
            "rope: {} elements do not split into heads of {}",
            x.len(),
            head_size
        ));
    }
    if cos_row.len() != half || sin_row.len() != half {
        return Err(invariant_error!(
            "rope: table rows of {}/{} elements, expected {}",
            cos_row.len(),
            sin_row.len(),
            half
        ));
    }

    for head in x.chunks_exact_mut(head_size) {
        let (first, second) = head.split_at_mut(half);
        for g in 0..half {
            let v0 = first[g];
            let v1 = second[g];
            let (c, s) = (cos_row[g], sin_row[g]);
            first[g] = c * v0 - s * v1;
            second[g] = s * v0 + c * v1;
        }
    }
    Ok(())
}

/// Apply the rotation for `pos` to `query` and `key` in place
pub fn rope(
    query: &mut [f32],
    key: &mut [f32],
    head_size: usize,
    pos: usize,
    cos_cache: &[f32],
    sin_cache: &[f32],
) -> ForgeResult<()> {
    let half = head_size / 2;
    let start = pos * half;
    let end = start + half;
    if end > cos_cache.len() || end > sin_cache.len() {
        return Err(invariant_error!(
            "rope: position {} outside caches of {} rows",
            pos,
            cos_cache.len() / half.max(1)
        ));
    }
    let cos_row = &cos_cache[start..end];
    let sin_row = &sin_cache[start..end];
    rotate_heads(query, head_size, cos_row, sin_row)?;
    rotate_heads(key, head_size, cos_row, sin_row)
}
