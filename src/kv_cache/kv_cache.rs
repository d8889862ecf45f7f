//! Contiguous per-layer key/value cache
//!
//! Keys and values each live in one `[layer_count, context_length, kv_dim]`
//! tensor. The entry for `(layer, pos)` is the `kv_dim` span starting at
//! `layer * context_length * kv_dim + pos * kv_dim`. Within a generation
//! session each entry is written once, by the forward pass for `pos`.

use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::memory::Allocator;
use crate::tensor::{DataType, Tensor};

/// Addressing for the cache tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheLayout {
    pub layer_count: usize,
    pub context_length: usize,
    pub kv_dim: usize,
}

impl KvCacheLayout {
    pub fn new(layer_count: usize, context_length: usize, kv_dim: usize) -> Self {
        Self {
            layer_count,
            context_length,
            kv_dim,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.layer_count, self.context_length, self.kv_dim]
    }

    pub fn total_elements(&self) -> usize {
        self.layer_count * self.context_length * self.kv_dim
    }

    /// Element offset of the `(layer, pos)` entry
    pub fn offset(&self, layer: usize, pos: usize) -> ForgeResult<usize> {
        if layer >= self.layer_count {
            return Err(ForgeError::OutOfBounds(format!(
                "kv cache layer {} >= {}",
                layer, self.layer_count
            )));
        }
        if pos >= self.context_length {
            return Err(ForgeError::OutOfBounds(format!(
                "kv cache position {} >= {}",
                pos, self.context_length
            )));
        }
        Ok(layer * self.context_length * self.kv_dim + pos * self.kv_dim)
    }
}

/// Key and value cache tensors with their layout
#[derive(Debug, Clone)]
pub struct KvCache {
    layout: KvCacheLayout,
    keys: Tensor,
    values: Tensor,
}

impl KvCache {
    /// Allocate zero-filled caches
    pub fn new(layout: KvCacheLayout, allocator: Arc<dyn Allocator>) -> ForgeResult<Self> {
        tracing::debug!(
            layers = layout.layer_count,
            context_length = layout.context_length,
            kv_dim = layout.kv_dim,
            "allocating kv cache"
        );
        let keys = Tensor::new(DataType::F32, &layout.dims(), Arc::clone(&allocator))?;
        let values = Tensor::new(DataType::F32, &layout.dims(), allocator)?;
        Ok(Self {
            layout,
            keys,
            values,
        })
    }

    pub fn layout(&self) -> &KvCacheLayout {
        &self.layout
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Key and value views of the `(layer, pos)` entry
    pub fn slice(&self, layer: usize, pos: usize) -> ForgeResult<(Tensor, Tensor)> {
        let offset = self.layout.offset(layer, pos)?;
        let dims = [self.layout.kv_dim];
        Ok((
            self.keys.view(offset, &dims)?,
            self.values.view(offset, &dims)?,
        ))
    }

    /// Zero both caches
    pub fn clear(&self) -> ForgeResult<()> {
        self.keys.write::<f32>()?.fill(0.0);
        self.values.write::<f32>()?.fill(0.0);
        Ok(())
    }
}
