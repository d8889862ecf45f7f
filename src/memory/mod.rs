//! Memory management for host tensors
//!
//! Allocators hand out raw blocks; buffers wrap a block (or an alias into the
//! mapped weight file) and police typed access to it.
//!
//! # Ownership
//!
//! - An owning [`Buffer`] releases its block exactly once, through the
//!   allocator that produced it, when the last reference is dropped.
//! - An external [`Buffer`] is read-only and never frees; it keeps its
//!   [`ExternalMemory`] source alive instead.

pub mod allocator;
pub mod buffer;

pub use allocator::{Allocator, AllocatorStats, CpuAllocator, DeviceType, TrackingAllocator};
pub use buffer::{Buffer, BufferMut, BufferRef, ExternalMemory};
