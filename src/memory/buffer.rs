//! Reference-counted raw memory blocks
//!
//! A [`Buffer`] either owns its memory (allocated through an injected
//! [`Allocator`] and released on drop) or aliases an external, read-only
//! source such as the memory-mapped weight file. External sources are kept
//! alive by reference counting, so an aliasing buffer can never outlive the
//! memory it points into.
//!
//! Access goes through borrow guards: any number of readers or a single
//! writer at a time, checked at runtime. Conflicting access is reported as
//! [`ForgeError::BufferBorrowed`] instead of producing aliased `&mut`.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use bytemuck::Pod;

use super::allocator::Allocator;
use crate::error::{ForgeError, ForgeResult};

/// Read-only memory owned outside the buffer system
pub trait ExternalMemory {
    fn bytes(&self) -> &[u8];
}

impl ExternalMemory for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl ExternalMemory for Vec<f32> {
    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

impl ExternalMemory for Vec<i32> {
    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

enum Memory {
    Owned {
        ptr: Option<NonNull<u8>>,
        allocator: Arc<dyn Allocator>,
    },
    External {
        source: Rc<dyn ExternalMemory>,
        offset: usize,
    },
}

/// Block of raw memory, owning or aliasing
pub struct Buffer {
    size: usize,
    memory: Memory,
    borrow: RefCell<()>,
}

impl Buffer {
    /// Allocate an owning buffer of `size` bytes.
    ///
    /// A zero-sized buffer holds no memory and is not an error.
    pub fn allocate(size: usize, allocator: Arc<dyn Allocator>) -> ForgeResult<Self> {
        let ptr = if size == 0 {
            None
        } else {
            Some(
                allocator
                    .allocate(size)
                    .ok_or(ForgeError::AllocationFailed(size))?,
            )
        };
        Ok(Self {
            size,
            memory: Memory::Owned { ptr, allocator },
            borrow: RefCell::new(()),
        })
    }

    /// Alias `size` bytes of an external source starting at byte `offset`.
    ///
    /// Never allocates; the source is never freed by this buffer.
    pub fn external(
        source: Rc<dyn ExternalMemory>,
        offset: usize,
        size: usize,
    ) -> ForgeResult<Self> {
        let available = source.bytes().len();
        let end = offset.checked_add(size).ok_or_else(|| {
            ForgeError::OutOfBounds(format!("external range {}+{} overflows", offset, size))
        })?;
        if end > available {
            return Err(ForgeError::OutOfBounds(format!(
                "external range {}..{} exceeds source of {} bytes",
                offset, end, available
            )));
        }
        Ok(Self {
            size,
            memory: Memory::External { source, offset },
            borrow: RefCell::new(()),
        })
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this buffer releases its memory
    pub fn owns_memory(&self) -> bool {
        matches!(self.memory, Memory::Owned { .. })
    }

    /// External memory is read-only; owned memory is writable
    pub fn is_writable(&self) -> bool {
        self.owns_memory()
    }

    pub fn allocator(&self) -> Option<&Arc<dyn Allocator>> {
        match &self.memory {
            Memory::Owned { allocator, .. } => Some(allocator),
            Memory::External { .. } => None,
        }
    }

    /// Start address, for identity checks only
    ///
    /// Computed without forming a slice, so it is safe to call while a
    /// writer holds the memory.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.memory {
            Memory::Owned { ptr: Some(p), .. } => p.as_ptr().cast_const(),
            Memory::Owned { ptr: None, .. } => NonNull::<u8>::dangling().as_ptr().cast_const(),
            Memory::External { source, offset } => source.bytes().as_ptr().wrapping_add(*offset),
        }
    }

    /// Copy following the ownership rule: an owning buffer is deep-copied
    /// into fresh memory from the same allocator, an aliasing buffer yields
    /// another alias of the same memory.
    pub fn duplicate(&self) -> ForgeResult<Buffer> {
        match &self.memory {
            Memory::Owned { allocator, .. } => {
                let copy = Buffer::allocate(self.size, Arc::clone(allocator))?;
                {
                    let src = self.read::<u8>(0, self.size)?;
                    let mut dst = copy.write::<u8>(0, self.size)?;
                    dst.copy_from_slice(&src);
                }
                Ok(copy)
            }
            Memory::External { source, offset } => {
                Buffer::external(Rc::clone(source), *offset, self.size)
            }
        }
    }

    /// Borrow `len` elements of `T` starting at element `offset` for reading
    pub fn read<T: Pod>(&self, offset: usize, len: usize) -> ForgeResult<BufferRef<'_, T>> {
        let guard = self.borrow.try_borrow().map_err(|_| {
            ForgeError::BufferBorrowed("read requested while a writer is active".to_string())
        })?;
        let range = self.byte_range::<T>(offset, len)?;
        let data = cast::<T>(&self.raw_bytes()[range])?;
        Ok(BufferRef {
            _guard: guard,
            data,
        })
    }

    /// Borrow `len` elements of `T` starting at element `offset` for writing
    pub fn write<T: Pod>(&self, offset: usize, len: usize) -> ForgeResult<BufferMut<'_, T>> {
        let ptr = match &self.memory {
            Memory::Owned { ptr, .. } => *ptr,
            Memory::External { .. } => return Err(ForgeError::ReadOnlyBuffer),
        };
        let guard = self.borrow.try_borrow_mut().map_err(|_| {
            ForgeError::BufferBorrowed("write requested while buffer is borrowed".to_string())
        })?;
        let range = self.byte_range::<T>(offset, len)?;
        let bytes: &mut [u8] = match ptr {
            // SAFETY: the block is `size` bytes long, owned by this buffer, and
            // the RefMut guard held alongside the slice excludes every other
            // borrow for the slice's lifetime.
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.size) },
            None => &mut [],
        };
        let data: &mut [T] = if range.is_empty() {
            &mut []
        } else {
            bytemuck::try_cast_slice_mut::<u8, T>(&mut bytes[range])
                .map_err(|e| ForgeError::OutOfBounds(format!("typed write view: {:?}", e)))?
        };
        Ok(BufferMut {
            _guard: guard,
            data,
        })
    }

    fn raw_bytes(&self) -> &[u8] {
        match &self.memory {
            // SAFETY: the block is `size` bytes long and lives as long as self.
            Memory::Owned { ptr: Some(p), .. } => unsafe {
                std::slice::from_raw_parts(p.as_ptr(), self.size)
            },
            Memory::Owned { ptr: None, .. } => &[],
            Memory::External { source, offset } => &source.bytes()[*offset..*offset + self.size],
        }
    }

    fn byte_range<T>(&self, offset: usize, len: usize) -> ForgeResult<std::ops::Range<usize>> {
        let elem = std::mem::size_of::<T>();
        let start = offset.checked_mul(elem);
        let end = offset
            .checked_add(len)
            .and_then(|n| n.checked_mul(elem));
        match (start, end) {
            (Some(start), Some(end)) if end <= self.size => Ok(start..end),
            _ => Err(ForgeError::OutOfBounds(format!(
                "elements {}..{} of {} bytes each exceed buffer of {} bytes",
                offset,
                offset.saturating_add(len),
                elem,
                self.size
            ))),
        }
    }
}

fn cast<T: Pod>(bytes: &[u8]) -> ForgeResult<&[T]> {
    // An empty slice may carry a pointer unaligned for T.
    if bytes.is_empty() {
        return Ok(&[]);
    }
    bytemuck::try_cast_slice::<u8, T>(bytes)
        .map_err(|e| ForgeError::OutOfBounds(format!("typed read view: {:?}", e)))
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Memory::Owned {
            ptr: Some(ptr),
            allocator,
        } = &self.memory
        {
            // SAFETY: ptr came from allocator.allocate(size) and ownership is
            // unique to this buffer.
            unsafe { allocator.release(*ptr, self.size) };
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("owns_memory", &self.owns_memory())
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

/// Shared typed borrow of a buffer region
pub struct BufferRef<'a, T> {
    _guard: Ref<'a, ()>,
    data: &'a [T],
}

impl<T> Deref for BufferRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

/// Exclusive typed borrow of a buffer region
pub struct BufferMut<'a, T> {
    _guard: RefMut<'a, ()>,
    data: &'a mut [T],
}

impl<T> Deref for BufferMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T> DerefMut for BufferMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::{CpuAllocator, TrackingAllocator};

    fn tracking() -> Arc<TrackingAllocator> {
        Arc::new(TrackingAllocator::new(CpuAllocator::new()))
    }

    #[test]
    fn test_owning_buffer_allocates_and_releases() {
        let allocator = tracking();
        {
            let buffer = Buffer::allocate(64, allocator.clone()).unwrap();
            assert!(buffer.owns_memory());
            assert!(buffer.is_writable());
            assert_eq!(buffer.size(), 64);
            assert_eq!(allocator.stats().live_allocations(), 1);
        }
        let stats = allocator.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn test_zero_sized_buffer_holds_no_memory() {
        let allocator = tracking();
        let buffer = Buffer::allocate(0, allocator.clone()).unwrap();
        assert!(buffer.owns_memory());
        assert_eq!(buffer.read::<f32>(0, 0).unwrap().len(), 0);
        drop(buffer);
        assert_eq!(allocator.stats().allocations, 0);
        assert_eq!(allocator.stats().releases, 0);
    }

    #[test]
    fn test_external_buffer_never_allocates_or_frees() {
        let allocator = tracking();
        let source: Rc<dyn ExternalMemory> = Rc::new(vec![1.0f32, 2.0, 3.0, 4.0]);
        {
            let buffer = Buffer::external(Rc::clone(&source), 4, 8).unwrap();
            assert!(!buffer.owns_memory());
            assert!(buffer.allocator().is_none());
            assert_eq!(&*buffer.read::<f32>(0, 2).unwrap(), &[2.0, 3.0]);
            assert_eq!(Rc::strong_count(&source), 2);
        }
        assert_eq!(Rc::strong_count(&source), 1);
        assert_eq!(source.bytes().len(), 16);
        assert_eq!(allocator.stats(), Default::default());
    }

    #[test]
    fn test_external_buffer_is_read_only() {
        let source: Rc<dyn ExternalMemory> = Rc::new(vec![0.0f32; 4]);
        let buffer = Buffer::external(source, 0, 16).unwrap();
        assert!(matches!(
            buffer.write::<f32>(0, 4),
            Err(ForgeError::ReadOnlyBuffer)
        ));
    }

    #[test]
    fn test_external_range_checked() {
        let source: Rc<dyn ExternalMemory> = Rc::new(vec![0u8; 8]);
        assert!(matches!(
            Buffer::external(source, 4, 8),
            Err(ForgeError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_duplicate_owning_is_deep_copy() {
        let allocator = tracking();
        let original = Buffer::allocate(16, allocator.clone()).unwrap();
        original
            .write::<f32>(0, 4)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let copy = original.duplicate().unwrap();
        assert!(copy.owns_memory());
        assert_ne!(copy.as_ptr(), original.as_ptr());
        assert_eq!(&*copy.read::<f32>(0, 4).unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        copy.write::<f32>(0, 1).unwrap()[0] = 9.0;
        assert_eq!(original.read::<f32>(0, 1).unwrap()[0], 1.0);
        assert_eq!(allocator.stats().allocations, 2);
    }

    #[test]
    fn test_duplicate_external_is_alias() {
        let source: Rc<dyn ExternalMemory> = Rc::new(vec![5.0f32; 2]);
        let original = Buffer::external(source, 0, 8).unwrap();
        let alias = original.duplicate().unwrap();
        assert!(!alias.owns_memory());
        assert_eq!(alias.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_conflicting_borrows_rejected() {
        let buffer = Buffer::allocate(16, tracking()).unwrap();
        let reader = buffer.read::<f32>(0, 4).unwrap();
        assert!(matches!(
            buffer.write::<f32>(0, 4),
            Err(ForgeError::BufferBorrowed(_))
        ));
        let second_reader = buffer.read::<f32>(0, 2).unwrap();
        drop(reader);
        drop(second_reader);

        let writer = buffer.write::<f32>(0, 4).unwrap();
        assert!(matches!(
            buffer.read::<f32>(0, 1),
            Err(ForgeError::BufferBorrowed(_))
        ));
        drop(writer);
        assert!(buffer.read::<f32>(0, 4).is_ok());
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let buffer = Buffer::allocate(16, tracking()).unwrap();
        assert!(matches!(
            buffer.read::<f32>(2, 3),
            Err(ForgeError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_address_available_while_writer_active() {
        let buffer = Buffer::allocate(16, tracking()).unwrap();
        let mut guard = buffer.write::<f32>(0, 4).unwrap();
        guard[0] = 1.0;
        assert_eq!(buffer.as_ptr(), guard.as_ptr().cast::<u8>());
        assert!(format!("{:?}", buffer).contains("owns_memory: true"));
        drop(guard);

        let source: Rc<dyn ExternalMemory> = Rc::new(vec![0u8; 12]);
        let alias = Buffer::external(Rc::clone(&source), 4, 8).unwrap();
        assert_eq!(alias.as_ptr(), source.bytes()[4..].as_ptr());
    }
}
