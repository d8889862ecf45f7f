//! Per-reply generation statistics

use std::fmt;
use std::time::Duration;

/// Why a reply stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token
    EndOfSequence,
    /// The reply hit the configured step limit
    MaxSteps,
    /// The session reached the model's context length
    ContextFull,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::EndOfSequence => "end of sequence",
            StopReason::MaxSteps => "step limit",
            StopReason::ContextFull => "context full",
        };
        f.write_str(reason)
    }
}

/// Counters for one call to the generator
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    /// Prompt tokens fed through the model
    pub prompt_tokens: usize,

    /// Tokens emitted in the reply
    pub generated_tokens: usize,

    /// Wall time for prefill and decode
    pub elapsed: Duration,

    pub stop_reason: StopReason,
}

impl GenerationStats {
    /// Forward passes per second, counting prompt and reply tokens
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.prompt_tokens + self.generated_tokens) as f64 / secs
    }
}

impl fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} prompt + {} generated tokens in {:.2}s ({:.2} tok/s, {})",
            self.prompt_tokens,
            self.generated_tokens,
            self.elapsed.as_secs_f64(),
            self.tokens_per_second(),
            self.stop_reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_per_second() {
        let stats = GenerationStats {
            prompt_tokens: 6,
            generated_tokens: 4,
            elapsed: Duration::from_secs(2),
            stop_reason: StopReason::MaxSteps,
        };
        assert!((stats.tokens_per_second() - 5.0).abs() < 1e-9);
        assert!(stats.to_string().contains("step limit"));
    }

    #[test]
    fn test_zero_elapsed() {
        let stats = GenerationStats {
            prompt_tokens: 1,
            generated_tokens: 0,
            elapsed: Duration::ZERO,
            stop_reason: StopReason::EndOfSequence,
        };
        assert_eq!(stats.tokens_per_second(), 0.0);
    }
}
