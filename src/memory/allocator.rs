//! Device-scoped memory providers
//!
//! Allocators are injected explicitly (`Arc<dyn Allocator>`) into everything
//! that creates owning buffers, so tests can swap in a [`TrackingAllocator`]
//! and count every allocation and release.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Device an allocator hands out memory for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
}

/// Memory provider contract
///
/// `allocate(0)` returns `None` without being an error; a `None` for a
/// non-zero size means the provider is out of memory.
pub trait Allocator: fmt::Debug + Send + Sync {
    fn device(&self) -> DeviceType;

    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Return memory to the provider.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate(size)` on this allocator and
    /// must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Host allocator with zero-filled, 64-byte aligned blocks
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuAllocator;

impl CpuAllocator {
    /// Cache-line alignment; also satisfies every supported element type.
    pub const ALIGNMENT: usize = 64;

    pub fn new() -> Self {
        CpuAllocator
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, Self::ALIGNMENT).ok()
    }
}

impl Allocator for CpuAllocator {
    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Self::layout(size)?;
        // Zero-filled so scratch tensors never expose stale memory.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = Self::layout(size) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Allocation counters reported by [`TrackingAllocator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: usize,
    pub releases: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

impl AllocatorStats {
    /// Blocks handed out and not yet released
    pub fn live_allocations(&self) -> usize {
        self.allocations - self.releases
    }
}

/// Allocator wrapper that records every allocate/release pair
#[derive(Debug, Default)]
pub struct TrackingAllocator<A: Allocator = CpuAllocator> {
    inner: A,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl<A: Allocator> TrackingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn device(&self) -> DeviceType {
        self.inner.device()
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(size)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        tracing::trace!(size, live, "allocated block");
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        self.inner.release(ptr, size);
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        tracing::trace!(size, "released block");
    }
}
