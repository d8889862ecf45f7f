//! Key/value cache for autoregressive decoding
//!
//! One contiguous key tensor and one value tensor cover every layer and
//! position; entries are addressed through [`KvCacheLayout`].

pub mod kv_cache;

pub use kv_cache::{KvCache, KvCacheLayout};
