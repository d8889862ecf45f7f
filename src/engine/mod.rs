//! Text generation on top of the model
//!
//! ## Module Structure
//!
//! - [`config`] - Generation settings and builders
//! - [`chat`] - ChatML prompt template
//! - [`generator`] - Prefill/decode loop and chat sessions
//! - [`stats`] - Per-reply statistics
//! - [`stream`] - Incremental detokenization for streamed output

pub mod chat;
pub mod config;
pub mod generator;
pub mod stats;
pub mod stream;

pub use chat::{apply_chat_template, ChatMessage, Role, DEFAULT_SYSTEM_PROMPT};
pub use config::GenerationConfig;
pub use generator::{ChatSession, GenerationOutput, Generator};
pub use stats::{GenerationStats, StopReason};
pub use stream::StreamDecoder;
