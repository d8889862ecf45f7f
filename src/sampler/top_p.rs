//! Nucleus (top-p) sampling
//!
//! Top-p sampling restricts sampling to the smallest set of tokens whose
//! cumulative probability reaches a threshold, then draws from that set.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{ForgeError, ForgeResult};

/// Top-p sampler with temperature and a seedable generator
#[derive(Debug, Clone)]
pub struct TopPSampler {
    temperature: f32,
    top_p: f32,
    rng: ChaCha8Rng,
}

impl TopPSampler {
    /// Create a sampler; `seed = None` seeds from system entropy
    pub fn new(temperature: f32, top_p: f32, seed: Option<u64>) -> ForgeResult<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(ForgeError::InvalidTemperature(temperature));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(ForgeError::InvalidTopP(top_p));
        }
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            temperature,
            top_p,
            rng,
        })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Draw a token id from `logits`
    pub fn sample(&mut self, logits: &[f32]) -> ForgeResult<usize> {
        let nucleus = self.nucleus(logits)?;
        let r: f32 = self.rng.gen();
        Ok(pick(&nucleus, r))
    }

    /// Renormalized `(token, probability)` nucleus, most likely first
    pub fn nucleus(&self, logits: &[f32]) -> ForgeResult<Vec<(usize, f32)>> {
        if logits.is_empty() {
            return Err(ForgeError::EmptyLogits);
        }
        let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut weights: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i, ((l - max) / self.temperature).exp()))
            .collect();
        let total: f32 = weights.iter().map(|(_, w)| w).sum();
        for (_, w) in &mut weights {
            *w /= total;
        }
        weights.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cumulative = 0.0f32;
        let mut cutoff = weights.len();
        for (i, &(_, p)) in weights.iter().enumerate() {
            cumulative += p;
            if cumulative >= self.top_p {
                cutoff = i + 1;
                break;
            }
        }
        weights.truncate(cutoff);

        let mass: f32 = weights.iter().map(|(_, w)| w).sum();
        for (_, w) in &mut weights {
            *w /= mass;
        }
        Ok(weights)
    }
}

/// First entry whose cumulative weight exceeds `r`, else the last entry
fn pick(nucleus: &[(usize, f32)], r: f32) -> usize {
    let mut cumulative = 0.0f32;
    for &(token, p) in nucleus {
        cumulative += p;
        if cumulative > r {
            return token;
        }
    }
    nucleus.last().map(|&(token, _)| token).unwrap_or(0)
}
