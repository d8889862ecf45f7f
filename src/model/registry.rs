//! Named buffer registry
//!
//! Layers exchange tensors through a map from [`BufferKey`] to [`Tensor`].
//! Several roles deliberately share one physical tensor to avoid extra
//! scratch memory:
//!
//! - `RmsNorm`, `Mha` and `Down` are one `[dim]` tensor. Within a block it
//!   holds the normalized input, then the attention output, then (after the
//!   post-norm rewrote it) the MLP down projection.
//! - `Query` and `AttnOutput` are one `[dim]` tensor. The output projection
//!   overwrites the query once attention has consumed it.
//!
//! Writes through one alias are visible through the others, so call order
//! within a block matters.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::tensor::Tensor;

/// Role of a registry-resident tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKey {
    TokenId,
    EmbeddingInput,
    RmsNorm,
    Mha,
    Down,
    Gate,
    Up,
    KCache,
    VCache,
    Query,
    AttnOutput,
    Score,
    Logits,
}

impl BufferKey {
    pub const ALL: [BufferKey; 13] = [
        BufferKey::TokenId,
        BufferKey::EmbeddingInput,
        BufferKey::RmsNorm,
        BufferKey::Mha,
        BufferKey::Down,
        BufferKey::Gate,
        BufferKey::Up,
        BufferKey::KCache,
        BufferKey::VCache,
        BufferKey::Query,
        BufferKey::AttnOutput,
        BufferKey::Score,
        BufferKey::Logits,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BufferKey::TokenId => "token_id",
            BufferKey::EmbeddingInput => "embedding_input",
            BufferKey::RmsNorm => "rmsnorm",
            BufferKey::Mha => "mha",
            BufferKey::Down => "down",
            BufferKey::Gate => "gate",
            BufferKey::Up => "up",
            BufferKey::KCache => "k_cache",
            BufferKey::VCache => "v_cache",
            BufferKey::Query => "query",
            BufferKey::AttnOutput => "attn_output",
            BufferKey::Score => "score",
            BufferKey::Logits => "logits",
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Map from buffer role to tensor, one per model instance
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<BufferKey, Tensor>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tensor` under `key`
    ///
    /// Fails with [`ForgeError::DuplicateBuffer`] and leaves the registry
    /// unchanged if the key is taken.
    pub fn insert(&mut self, key: BufferKey, tensor: Tensor) -> ForgeResult<()> {
        if self.buffers.contains_key(&key) {
            return Err(ForgeError::DuplicateBuffer(key.to_string()));
        }
        tracing::debug!(key = %key, dims = ?tensor.dims(), "registering buffer");
        self.buffers.insert(key, tensor);
        Ok(())
    }

    pub fn get(&self, key: BufferKey) -> ForgeResult<&Tensor> {
        self.buffers
            .get(&key)
            .ok_or_else(|| ForgeError::MissingBuffer(key.to_string()))
    }

    pub fn contains(&self, key: BufferKey) -> bool {
        self.buffers.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Other keys registered on exactly the same view as `key`
    pub fn aliases(&self, key: BufferKey) -> Vec<BufferKey> {
        let Some(tensor) = self.buffers.get(&key) else {
            return Vec::new();
        };
        BufferKey::ALL
            .iter()
            .copied()
            .filter(|&other| other != key)
            .filter(|other| {
                self.buffers
                    .get(other)
                    .is_some_and(|t| t.shares_view_with(tensor))
            })
            .collect()
    }
}
