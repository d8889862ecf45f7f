//! Token selection from final logits
//!
//! `temperature <= 0` selects greedy arg-max; anything hotter uses nucleus
//! sampling.

pub mod top_p;

pub use top_p::TopPSampler;

use crate::error::{ForgeError, ForgeResult};

/// Sampling strategy
#[derive(Debug, Clone, Default)]
pub enum Sampler {
    #[default]
    Greedy,
    TopP(TopPSampler),
}

impl Sampler {
    /// Pick the strategy for `temperature`
    pub fn from_temperature(temperature: f32, top_p: f32, seed: Option<u64>) -> ForgeResult<Self> {
        if temperature.is_nan() {
            return Err(ForgeError::InvalidTemperature(temperature));
        }
        if temperature <= 0.0 {
            return Ok(Sampler::Greedy);
        }
        Ok(Sampler::TopP(TopPSampler::new(temperature, top_p, seed)?))
    }

    pub fn sample(&mut self, logits: &[f32]) -> ForgeResult<usize> {
        match self {
            Sampler::Greedy => argmax(logits),
            Sampler::TopP(sampler) => sampler.sample(logits),
        }
    }
}

/// Index of the largest logit; the lowest index wins ties
pub fn argmax(logits: &[f32]) -> ForgeResult<usize> {
    if logits.is_empty() {
        return Err(ForgeError::EmptyLogits);
    }
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate().skip(1) {
        if l > logits[best] {
            best = i;
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]).unwrap(), 1);
        assert_eq!(argmax(&[-1.0]).unwrap(), 0);
        assert!(matches!(argmax(&[]), Err(ForgeError::EmptyLogits)));
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let mut sampler = Sampler::from_temperature(0.0, 0.9, None).unwrap();
        assert!(matches!(sampler, Sampler::Greedy));
        let logits = [0.3, 0.9, 0.9, -2.0];
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn test_from_temperature_dispatch() {
        assert!(matches!(
            Sampler::from_temperature(0.7, 0.9, Some(1)).unwrap(),
            Sampler::TopP(_)
        ));
        assert!(matches!(
            Sampler::from_temperature(-0.1, 0.9, None).unwrap(),
            Sampler::Greedy
        ));
        assert!(Sampler::from_temperature(f32::NAN, 0.9, None).is_err());
        assert!(Sampler::from_temperature(0.7, 0.0, None).is_err());
    }
}
