//! Configuration for text generation
//!
//! This module defines [`GenerationConfig`], which controls sampling and the
//! length of each generated reply.

use crate::error::{ForgeError, ForgeResult};
use crate::sampler::Sampler;

/// Configuration for the generation loop
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Sampling temperature; `<= 0` means greedy decoding
    pub temperature: f32,

    /// Nucleus threshold for temperature sampling
    pub top_p: f32,

    /// Maximum tokens generated per reply
    pub max_steps: usize,

    /// Seed for reproducible sampling; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            temperature: 0.0,
            top_p: 0.9,
            max_steps: 1024,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a new generation config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set nucleus threshold
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set maximum tokens per reply
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set sampling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject settings the sampler or loop cannot honor
    pub fn validate(&self) -> ForgeResult<()> {
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(ForgeError::InvalidTemperature(self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ForgeError::InvalidTopP(self.top_p));
        }
        if self.max_steps == 0 {
            return Err(ForgeError::InvalidConfiguration(
                "max_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Sampler for these settings
    pub fn sampler(&self) -> ForgeResult<Sampler> {
        self.validate()?;
        Sampler::from_temperature(self.temperature, self.top_p, self.seed)
    }
}
