//! Transformer architecture derived from the weight file header

use std::fmt;

use crate::attention::GqaConfig;
use crate::error::ForgeResult;
use crate::kv_cache::KvCacheLayout;
use crate::loader::ModelHeader;
use crate::model_error;

/// Immutable architecture description of a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformerConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub layer_count: usize,
    pub q_head_count: usize,
    pub kv_head_count: usize,
    pub context_length: usize,
    pub head_size: usize,
    pub kv_dim: usize,
    /// Query heads per KV head
    pub mem_num: usize,
    pub vocab_size: usize,
    pub shared_token_embedding: bool,
}

impl TransformerConfig {
    /// Derive and validate the configuration from a raw header
    pub fn from_header(header: &ModelHeader) -> ForgeResult<Self> {
        let positive = |name: &str, value: i32| -> ForgeResult<usize> {
            if value <= 0 {
                return Err(model_error!("header field {} must be positive, got {}", name, value));
            }
            Ok(value as usize)
        };

        let dim = positive("dim", header.dim)?;
        let hidden_dim = positive("hidden_dim", header.hidden_dim)?;
        let layer_count = positive("layer_num", header.layer_num)?;
        let q_head_count = positive("head_num", header.head_num)?;
        let kv_head_count = positive("kv_head_num", header.kv_head_num)?;
        let context_length = positive("seq_len", header.seq_len)?;
        if header.vocab_size == 0 {
            return Err(model_error!("header field vocab_size must be non-zero"));
        }
        let vocab_size = header.vocab_size.unsigned_abs() as usize;

        if dim % q_head_count != 0 {
            return Err(model_error!(
                "dim {} is not divisible by {} heads",
                dim,
                q_head_count
            ));
        }
        if q_head_count % kv_head_count != 0 {
            return Err(model_error!(
                "{} query heads cannot be grouped over {} kv heads",
                q_head_count,
                kv_head_count
            ));
        }
        let head_size = dim / q_head_count;
        if head_size % 2 != 0 {
            return Err(model_error!("head size {} must be even for RoPE", head_size));
        }

        Ok(Self {
            dim,
            hidden_dim,
            layer_count,
            q_head_count,
            kv_head_count,
            context_length,
            head_size,
            kv_dim: head_size * kv_head_count,
            mem_num: q_head_count / kv_head_count,
            vocab_size,
            shared_token_embedding: header.shared_token_embedding(),
        })
    }

    /// Columns of each RoPE cache
    pub fn freq_cache_size(&self) -> usize {
        self.head_size / 2
    }

    pub fn gqa(&self) -> GqaConfig {
        GqaConfig {
            head_num: self.q_head_count,
            kv_head_num: self.kv_head_count,
            head_size: self.head_size,
        }
    }

    pub fn kv_cache_layout(&self) -> KvCacheLayout {
        KvCacheLayout::new(self.layer_count, self.context_length, self.kv_dim)
    }

    /// Weight elements the file must hold after the header
    pub fn expected_weight_elements(&self) -> usize {
        let (d, h, l, v, kv) = (
            self.dim,
            self.hidden_dim,
            self.layer_count,
            self.vocab_size,
            self.kv_dim,
        );
        let per_layer = d // input norm
            + d * d + d // query
            + 2 * (kv * d + kv) // key, value
            + d * d // output
            + d // post norm
            + 3 * h * d; // gate, down, up
        let classifier = if self.shared_token_embedding { 0 } else { v * d };
        v * d + l * per_layer + d + 2 * self.context_length * self.freq_cache_size() + classifier
    }
}

impl fmt::Display for TransformerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dim={} hidden_dim={} layers={} vocab={} context={} heads={} kv_heads={} head_size={}",
            self.dim,
            self.hidden_dim,
            self.layer_count,
            self.vocab_size,
            self.context_length,
            self.q_head_count,
            self.kv_head_count,
            self.head_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn qwen_header() -> ModelHeader {
        ModelHeader {
            dim: 896,
            hidden_dim: 4864,
            layer_num: 24,
            head_num: 14,
            kv_head_num: 2,
            vocab_size: 151936,
            seq_len: 1024,
        }
    }

    #[test]
    fn test_derived_fields() {
        let config = TransformerConfig::from_header(&qwen_header()).unwrap();
        assert_eq!(config.head_size, 64);
        assert_eq!(config.kv_dim, 128);
        assert_eq!(config.mem_num, 7);
        assert_eq!(config.freq_cache_size(), 32);
        assert!(config.shared_token_embedding);
        assert_eq!(config.gqa().mem_num(), 7);
        assert_eq!(config.kv_cache_layout().dims(), [24, 1024, 128]);
    }

    #[test]
    fn test_negative_vocab_means_unshared() {
        let mut header = qwen_header();
        header.vocab_size = -151936;
        let config = TransformerConfig::from_header(&header).unwrap();
        assert_eq!(config.vocab_size, 151936);
        assert!(!config.shared_token_embedding);
    }

    #[test]
    fn test_invalid_headers_rejected() {
        let cases = [
            ModelHeader { dim: 0, ..qwen_header() },
            ModelHeader { vocab_size: 0, ..qwen_header() },
            ModelHeader { head_num: 5, ..qwen_header() },
            ModelHeader { kv_head_num: 3, ..qwen_header() },
            ModelHeader { dim: 42, head_num: 14, ..qwen_header() },
        ];
        for header in cases {
            let err = TransformerConfig::from_header(&header).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Load, "{:?}", header);
        }
    }

    #[test]
    fn test_expected_weight_elements_tiny() {
        let header = ModelHeader {
            dim: 4,
            hidden_dim: 8,
            layer_num: 1,
            head_num: 2,
            kv_head_num: 1,
            vocab_size: 5,
            seq_len: 4,
        };
        let config = TransformerConfig::from_header(&header).unwrap();
        // embed 20, norm 4, q 20, k 10, v 10, o 16, post 4, mlp 96, final 4, rope 8
        assert_eq!(config.expected_weight_elements(), 192);
    }
}
