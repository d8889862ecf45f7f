//! Model implementations
//! Decoder graph pieces and the Qwen2 orchestrator

pub mod config;
pub mod embedding;
pub mod layer;
pub mod qwen2;
pub mod registry;

pub use config::TransformerConfig;
pub use layer::{Layer, LayerKind, ParamLayer, Step};
pub use qwen2::{ModelState, Qwen2Model};
pub use registry::{BufferKey, BufferRegistry};
