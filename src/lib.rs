//! QwenForge - CPU inference for Qwen2-style transformers
//!
//! A small single-sequence inference engine: memory-mapped f32 weights, a
//! fixed graph of typed layers sharing named scratch buffers, a KV cache and
//! greedy or top-p sampling.

#![allow(clippy::too_many_arguments)] // Kernel entry points take every dimension explicitly
#![allow(clippy::needless_range_loop)] // Index loops mirror the math

pub mod attention;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod mlp;
pub mod model;
pub mod sampler;
pub mod tensor;
pub mod tokenizer;

pub use engine::{ChatSession, GenerationConfig, Generator};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use kv_cache::KvCache;
pub use memory::{Allocator, Buffer, CpuAllocator};
pub use model::{Qwen2Model, TransformerConfig};
pub use sampler::Sampler;
pub use tensor::{DataType, Tensor};
