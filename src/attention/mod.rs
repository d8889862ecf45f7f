//! Attention mechanism
//!
//! Grouped-query scaled dot-product attention over the KV cache, with rotary
//! position embeddings applied to queries and keys beforehand.

pub mod cpu;
pub mod rope;
pub mod softmax;

pub use cpu::mha;
pub use rope::{rope, RopeConfig};
pub use softmax::{softmax, softmax_in_place};

use crate::error::ForgeResult;
use crate::invariant_error;

/// Head layout for grouped-query attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GqaConfig {
    /// Query heads
    pub head_num: usize,
    /// Key/value heads
    pub kv_head_num: usize,
    pub head_size: usize,
}

impl GqaConfig {
    pub fn new(head_num: usize, kv_head_num: usize, head_size: usize) -> ForgeResult<Self> {
        if head_num == 0 || kv_head_num == 0 || head_size == 0 || head_num % kv_head_num != 0 {
            return Err(invariant_error!(
                "gqa: {} query heads cannot be grouped over {} kv heads of size {}",
                head_num,
                kv_head_num,
                head_size
            ));
        }
        Ok(Self {
            head_num,
            kv_head_num,
            head_size,
        })
    }

    /// Query heads per KV head
    pub fn mem_num(&self) -> usize {
        self.head_num / self.kv_head_num
    }

    pub fn dim(&self) -> usize {
        self.head_num * self.head_size
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_head_num * self.head_size
    }
}
