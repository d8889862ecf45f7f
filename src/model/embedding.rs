//! Token embedding lookup

use crate::error::{ForgeError, ForgeResult};
use crate::invariant_error;

/// Copy row `token_ids[i]` of `weight` (`[vocab_size, dim]`) into row `i` of `output`
pub fn embedding(
    weight: &[f32],
    vocab_size: usize,
    dim: usize,
    token_ids: &[i32],
    output: &mut [f32],
) -> ForgeResult<()> {
    if weight.len() != vocab_size * dim {
        return Err(invariant_error!(
            "embedding: weight has {} elements, expected {}x{}",
            weight.len(),
            vocab_size,
            dim
        ));
    }
    if output.len() != token_ids.len() * dim {
        return Err(invariant_error!(
            "embedding: output has {} elements for {} tokens of dim {}",
            output.len(),
            token_ids.len(),
            dim
        ));
    }

    for (&id, row) in token_ids.iter().zip(output.chunks_exact_mut(dim.max(1))) {
        let token = usize::try_from(id)
            .map_err(|_| ForgeError::OutOfBounds(format!("negative token id {}", id)))?;
        if token >= vocab_size {
            return Err(ForgeError::TokenOutOfRange { token, vocab_size });
        }
        row.copy_from_slice(&weight[token * dim..(token + 1) * dim]);
    }
    Ok(())
}
