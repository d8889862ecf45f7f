//! Synthetic weight files
//!
//! Weights are seeded pseudo-random values, norm weights are ones and the
//! RoPE caches hold real tables, so forward passes produce well-scaled,
//! reproducible logits.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use qwenforge::attention::RopeConfig;
use qwenforge::loader::ModelHeader;
use qwenforge::model::TransformerConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::tempfile_helpers::create_temp_dir;

pub const TINY_SEED: u64 = 17;

/// dim 4, hidden 8, one layer, two query heads over one KV head,
/// vocabulary 5, context 4
pub fn tiny_header(shared_classifier: bool) -> ModelHeader {
    ModelHeader {
        dim: 4,
        hidden_dim: 8,
        layer_num: 1,
        head_num: 2,
        kv_head_num: 1,
        vocab_size: if shared_classifier { 5 } else { -5 },
        seq_len: 4,
    }
}

/// Two layers with four query heads over two KV heads
pub fn small_header() -> ModelHeader {
    ModelHeader {
        dim: 8,
        hidden_dim: 16,
        layer_num: 2,
        head_num: 4,
        kv_head_num: 2,
        vocab_size: -7,
        seq_len: 6,
    }
}

/// Weight values in file order for `header`
pub fn synthetic_weights(header: &ModelHeader, seed: u64) -> anyhow::Result<Vec<f32>> {
    let config = TransformerConfig::from_header(header)?;
    let (d, h, l, v, kv) = (
        config.dim,
        config.hidden_dim,
        config.layer_count,
        config.vocab_size,
        config.kv_dim,
    );
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut random = |n: usize| -> Vec<f32> { (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect() };

    let mut weights = Vec::with_capacity(config.expected_weight_elements());
    weights.extend(random(v * d)); // embedding
    weights.extend(std::iter::repeat(1.0).take(l * d)); // input norms
    weights.extend(random(l * (d * d + d))); // wq + bias
    weights.extend(random(l * (kv * d + kv))); // wk + bias
    weights.extend(random(l * (kv * d + kv))); // wv + bias
    weights.extend(random(l * d * d)); // wo
    weights.extend(std::iter::repeat(1.0).take(l * d)); // post norms
    weights.extend(random(3 * l * h * d)); // gate, down, up
    weights.extend(std::iter::repeat(1.0).take(d)); // final norm

    let (cos, sin) = RopeConfig::new(config.head_size, config.context_length).tables()?;
    weights.extend(cos);
    weights.extend(sin);

    if !config.shared_token_embedding {
        weights.extend(random(v * d));
    }
    anyhow::ensure!(
        weights.len() == config.expected_weight_elements(),
        "fixture produced {} weights, config expects {}",
        weights.len(),
        config.expected_weight_elements()
    );
    Ok(weights)
}

/// Write a header followed by `weights` to `path`
pub fn write_weight_file(path: &Path, header: &ModelHeader, weights: &[f32]) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create weight file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.to_bytes())?;
    writer.write_all(bytemuck::cast_slice(weights))?;
    writer.flush()?;
    Ok(())
}

/// A synthetic model on disk; the directory lives as long as this value
pub struct ModelFixture {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
    pub header: ModelHeader,
    pub weights: Vec<f32>,
}

impl ModelFixture {
    pub fn new(header: ModelHeader, seed: u64) -> anyhow::Result<Self> {
        let dir = create_temp_dir()?;
        let path = dir.path().join("model.bin");
        let weights = synthetic_weights(&header, seed)?;
        write_weight_file(&path, &header, &weights)?;
        Ok(Self {
            dir,
            path,
            header,
            weights,
        })
    }

    pub fn tiny(shared_classifier: bool) -> anyhow::Result<Self> {
        Self::new(tiny_header(shared_classifier), TINY_SEED)
    }

    /// Rewrite the file with `weights` instead of the valid set
    pub fn rewrite(&self, weights: &[f32]) -> anyhow::Result<()> {
        write_weight_file(&self.path, &self.header, weights)
    }
}
