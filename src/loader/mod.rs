//! Weight file loading
//!
//! A fixed header followed by a flat run of f32 tensors, mapped read-only.

pub mod header;
pub mod mmap;

pub use header::ModelHeader;
pub use mmap::{WeightCursor, WeightFile};
