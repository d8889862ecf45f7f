//! CPU grouped-query attention over the KV cache

use crate::attention::{softmax::softmax_in_place, GqaConfig};
use crate::error::ForgeResult;
use crate::invariant_error;
use crate::kv_cache::KvCacheLayout;
use crate::tensor::matmul::dot;

/// Grouped-query attention for the token at `pos` of `layer`.
///
/// Query head `h` reads KV head `h / mem_num`. Scores cover cached positions
/// `0..=pos` only, so later cache slots never influence the result.
///
/// Arguments:
/// - query: `[head_num * head_size]`
/// - k_cache, v_cache: whole caches laid out by `layout`
/// - score: scratch of at least `head_num * context_length`
/// - out: `[head_num * head_size]`
#[allow(clippy::too_many_arguments)]
pub fn mha(
    layer: usize,
    pos: usize,
    gqa: &GqaConfig,
    layout: &KvCacheLayout,
    query: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    score: &mut [f32],
    out: &mut [f32],
) -> ForgeResult<()> {
    let head_size = gqa.head_size;
    let dim = gqa.dim();

    if layout.kv_dim != gqa.kv_dim() {
        return Err(invariant_error!(
            "mha: cache kv_dim {} != {} kv heads x {}",
            layout.kv_dim,
            gqa.kv_head_num,
            head_size
        ));
    }
    if query.len() != dim || out.len() != dim {
        return Err(invariant_error!(
            "mha: query {} / output {} elements, expected {}",
            query.len(),
            out.len(),
            dim
        ));
    }
    if k_cache.len() != layout.total_elements() || v_cache.len() != layout.total_elements() {
        return Err(invariant_error!(
            "mha: caches of {}/{} elements, layout needs {}",
            k_cache.len(),
            v_cache.len(),
            layout.total_elements()
        ));
    }
    if score.len() < gqa.head_num * layout.context_length {
        return Err(invariant_error!(
            "mha: score scratch of {} elements, need {}",
            score.len(),
            gqa.head_num * layout.context_length
        ));
    }
    // Bounds-checks layer and pos as well.
    layout.offset(layer, pos)?;

    let scale = 1.0 / (head_size as f32).sqrt();
    let mem_num = gqa.mem_num();

    for h in 0..gqa.head_num {
        let kv_head = h / mem_num;
        let q_head = &query[h * head_size..(h + 1) * head_size];
        let scores = &mut score[h * layout.context_length..h * layout.context_length + pos + 1];

        for (t, s) in scores.iter_mut().enumerate() {
            let base = layout.offset(layer, t)? + kv_head * head_size;
            *s = scale * dot(q_head, &k_cache[base..base + head_size]);
        }
        softmax_in_place(scores);

        let out_head = &mut out[h * head_size..(h + 1) * head_size];
        out_head.fill(0.0);
        for (t, &weight) in scores.iter().enumerate() {
            let base = layout.offset(layer, t)? + kv_head * head_size;
            for (o, &v) in out_head.iter_mut().zip(&v_cache[base..base + head_size]) {
                *o += weight * v;
            }
        }
    }
    Ok(())
}
