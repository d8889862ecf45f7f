//! Prefill/decode loop over a [`Qwen2Model`]

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::engine::chat::{apply_chat_template, ChatMessage, DEFAULT_SYSTEM_PROMPT};
use crate::engine::config::GenerationConfig;
use crate::engine::stats::{GenerationStats, StopReason};
use crate::engine::stream::StreamDecoder;
use crate::error::{ForgeError, ForgeResult};
use crate::model::Qwen2Model;
use crate::tokenizer::Tokenizer;

/// Result of one generation call
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub tokens: Vec<usize>,
    pub text: String,
    pub stats: GenerationStats,
}

/// Drives a loaded model with a tokenizer
///
/// The KV cache persists across calls, so each call continues the session
/// at [`Qwen2Model::next_position`]. Call [`reset`](Self::reset) to start
/// over.
pub struct Generator<T: Tokenizer> {
    model: Qwen2Model,
    tokenizer: T,
    config: GenerationConfig,
}

impl<T: Tokenizer> Generator<T> {
    pub fn new(mut model: Qwen2Model, tokenizer: T, config: GenerationConfig) -> ForgeResult<Self> {
        model.set_sampler(config.sampler()?);
        let vocab = model.config()?.vocab_size;
        if tokenizer.vocab_size() > vocab {
            warn!(
                tokenizer_vocab = tokenizer.vocab_size(),
                model_vocab = vocab,
                "tokenizer vocabulary is larger than the model's"
            );
        }
        Ok(Self {
            model,
            tokenizer,
            config,
        })
    }

    pub fn model(&self) -> &Qwen2Model {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Current session position
    pub fn position(&self) -> ForgeResult<usize> {
        self.model.next_position()
    }

    /// Clear the session
    pub fn reset(&mut self) -> ForgeResult<()> {
        self.model.reset()
    }

    /// Feed `prompt` and sample a reply
    ///
    /// Decoded text is passed to `on_piece` as soon as it forms complete
    /// characters; a character split across tokens arrives in one piece.
    /// Fails with [`ForgeError::ContextExhausted`] if the prompt itself does
    /// not fit in the remaining context.
    pub fn generate<F>(&mut self, prompt: &str, mut on_piece: F) -> ForgeResult<GenerationOutput>
    where
        F: FnMut(&str),
    {
        let _span = tracing::debug_span!("generate").entered();
        let prompt_tokens = self.tokenizer.encode(prompt)?;
        if prompt_tokens.is_empty() {
            return Err(ForgeError::InvalidConfiguration(
                "prompt encodes to no tokens".to_string(),
            ));
        }

        let context_length = self.model.config()?.context_length;
        let mut pos = self.model.next_position()?;
        if pos + prompt_tokens.len() > context_length {
            return Err(ForgeError::ContextExhausted {
                pos: pos + prompt_tokens.len(),
                context_length,
            });
        }

        let start = Instant::now();
        debug!(pos, tokens = prompt_tokens.len(), "prefill");
        let mut next = 0;
        for &token in &prompt_tokens {
            next = self.model.step(token, pos)?;
            pos += 1;
        }

        let mut stream = StreamDecoder::new();
        let mut text = String::new();
        let stop_reason = loop {
            if self.tokenizer.is_sentence_ending(next) {
                // Close the turn in the cache so a follow-up prompt continues
                // a complete transcript.
                if pos < context_length {
                    self.model.step(next, pos)?;
                }
                break StopReason::EndOfSequence;
            }
            if stream.tokens().len() >= self.config.max_steps {
                break StopReason::MaxSteps;
            }

            if let Some(piece) = stream.push(&self.tokenizer, next)? {
                on_piece(&piece);
                text.push_str(&piece);
            }

            if pos >= context_length {
                break StopReason::ContextFull;
            }
            next = self.model.step(next, pos)?;
            pos += 1;
        };
        if let Some(rest) = stream.flush(&self.tokenizer)? {
            on_piece(&rest);
            text.push_str(&rest);
        }
        let tokens = stream.tokens().to_vec();

        let stats = GenerationStats {
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: tokens.len(),
            elapsed: start.elapsed(),
            stop_reason,
        };
        info!(
            prompt_tokens = stats.prompt_tokens,
            generated_tokens = stats.generated_tokens,
            tokens_per_second = stats.tokens_per_second(),
            stop = %stats.stop_reason,
            "generation finished"
        );
        Ok(GenerationOutput {
            tokens,
            text,
            stats,
        })
    }
}

/// Multi-turn chat over a [`Generator`]
///
/// The system prompt is sent with the first turn of each session.
pub struct ChatSession<T: Tokenizer> {
    generator: Generator<T>,
    system_prompt: String,
}

impl<T: Tokenizer> ChatSession<T> {
    pub fn new(generator: Generator<T>) -> Self {
        Self::with_system_prompt(generator, DEFAULT_SYSTEM_PROMPT)
    }

    pub fn with_system_prompt(generator: Generator<T>, system_prompt: impl Into<String>) -> Self {
        Self {
            generator,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn generator(&self) -> &Generator<T> {
        &self.generator
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Prompt text for the next user turn
    pub fn render_turn(&self, user: &str) -> ForgeResult<String> {
        let mut messages = Vec::with_capacity(2);
        if self.generator.position()? == 0 && !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.as_str()));
        }
        messages.push(ChatMessage::user(user));
        let mut prompt = apply_chat_template(&messages, true);
        if self.generator.position()? > 0 {
            // The previous reply ended on the end token; finish its line.
            prompt.insert(0, '\n');
        }
        Ok(prompt)
    }

    pub fn send<F>(&mut self, user: &str, on_piece: F) -> ForgeResult<GenerationOutput>
    where
        F: FnMut(&str),
    {
        let prompt = self.render_turn(user)?;
        self.generator.generate(&prompt, on_piece)
    }

    pub fn reset(&mut self) -> ForgeResult<()> {
        self.generator.reset()
    }
}
