//! Fixed-size weight file header
//!
//! Seven native-endian `i32` fields precede the weights:
//! `dim, hidden_dim, layer_num, head_num, kv_head_num, vocab_size, seq_len`.
//! A positive `vocab_size` means the classifier reuses the token embedding;
//! a negative one means an unshared classifier follows the RoPE caches.

use crate::error::ForgeResult;
use crate::model_error;

/// Raw header values as stored in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    pub dim: i32,
    pub hidden_dim: i32,
    pub layer_num: i32,
    pub head_num: i32,
    pub kv_head_num: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl ModelHeader {
    /// Header size in bytes
    pub const SIZE: usize = 7 * std::mem::size_of::<i32>();

    /// Parse the header from the start of `bytes`
    pub fn parse(bytes: &[u8]) -> ForgeResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(model_error!(
                "header needs {} bytes, file has {}",
                Self::SIZE,
                bytes.len()
            ));
        }
        let mut fields = [0i32; 7];
        for (i, field) in fields.iter_mut().enumerate() {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *field = i32::from_ne_bytes(raw);
        }
        let [dim, hidden_dim, layer_num, head_num, kv_head_num, vocab_size, seq_len] = fields;
        Ok(Self {
            dim,
            hidden_dim,
            layer_num,
            head_num,
            kv_head_num,
            vocab_size,
            seq_len,
        })
    }

    /// Serialize in file order
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.dim,
            self.hidden_dim,
            self.layer_num,
            self.head_num,
            self.kv_head_num,
            self.vocab_size,
            self.seq_len,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_ne_bytes());
        }
        out
    }

    /// Classifier reuses the token embedding
    pub fn shared_token_embedding(&self) -> bool {
        self.vocab_size > 0
    }
}
