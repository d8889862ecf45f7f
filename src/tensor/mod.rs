//! Typed, shaped views over shared buffers
//!
//! A [`Tensor`] is a view: cloning it copies the shape and shares the
//! underlying [`Buffer`]. Writes through one view are visible through every
//! view of the same buffer. The only deep copy is [`Tensor::deep_copy`].
//!
//! Element access goes through [`Tensor::read`] and [`Tensor::write`], which
//! check the requested element type against the tensor's [`DataType`] and
//! return bounds-limited slice guards.

pub mod matmul;

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{ForgeError, ForgeResult};
use crate::memory::{Allocator, Buffer, BufferMut, BufferRef, ExternalMemory};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    I32,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 => std::mem::size_of::<f32>(),
            DataType::I32 => std::mem::size_of::<i32>(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::I32 => write!(f, "i32"),
        }
    }
}

/// Rust element types that may back a tensor
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

/// Shared typed borrow of a tensor's elements
pub type TensorRef<'a, T> = BufferRef<'a, T>;

/// Exclusive typed borrow of a tensor's elements
pub type TensorMut<'a, T> = BufferMut<'a, T>;

/// Shaped view over a reference-counted buffer
#[derive(Clone)]
pub struct Tensor {
    dtype: DataType,
    dims: Vec<usize>,
    buffer: Rc<Buffer>,
    /// Element offset of the view into the buffer
    offset: usize,
    element_count: usize,
}

fn element_count(dims: &[usize]) -> ForgeResult<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or_else(|| ForgeError::ShapeMismatch(format!("dims {:?} overflow", dims)))
    })
}

impl Tensor {
    /// Allocate an owning, zero-filled tensor
    pub fn new(dtype: DataType, dims: &[usize], allocator: Arc<dyn Allocator>) -> ForgeResult<Self> {
        let count = element_count(dims)?;
        let bytes = count
            .checked_mul(dtype.size())
            .ok_or_else(|| ForgeError::ShapeMismatch(format!("dims {:?} overflow", dims)))?;
        let buffer = Buffer::allocate(bytes, allocator)?;
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            buffer: Rc::new(buffer),
            offset: 0,
            element_count: count,
        })
    }

    /// Non-owning tensor aliasing `source` from `byte_offset`
    pub fn external(
        dtype: DataType,
        dims: &[usize],
        source: Rc<dyn ExternalMemory>,
        byte_offset: usize,
    ) -> ForgeResult<Self> {
        let count = element_count(dims)?;
        let bytes = count
            .checked_mul(dtype.size())
            .ok_or_else(|| ForgeError::ShapeMismatch(format!("dims {:?} overflow", dims)))?;
        let buffer = Buffer::external(source, byte_offset, bytes)?;
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            buffer: Rc::new(buffer),
            offset: 0,
            element_count: count,
        })
    }

    /// Owning f32 tensor initialized from `data`
    pub fn from_slice(dims: &[usize], data: &[f32], allocator: Arc<dyn Allocator>) -> ForgeResult<Self> {
        let tensor = Self::new(DataType::F32, dims, allocator)?;
        if data.len() != tensor.element_count {
            return Err(ForgeError::ShapeMismatch(format!(
                "{} values supplied for dims {:?}",
                data.len(),
                dims
            )));
        }
        tensor.write::<f32>()?.copy_from_slice(data);
        Ok(tensor)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn byte_size(&self) -> usize {
        self.element_count * self.dtype.size()
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    pub fn buffer(&self) -> &Rc<Buffer> {
        &self.buffer
    }

    /// Element offset of this view into its buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn owns_memory(&self) -> bool {
        self.buffer.owns_memory()
    }

    fn check_dtype<T: Element>(&self) -> ForgeResult<()> {
        if T::DTYPE != self.dtype {
            return Err(ForgeError::DtypeMismatch {
                actual: self.dtype.to_string(),
                requested: T::DTYPE.to_string(),
            });
        }
        Ok(())
    }

    /// Borrow the view's elements for reading
    pub fn read<T: Element>(&self) -> ForgeResult<TensorRef<'_, T>> {
        self.check_dtype::<T>()?;
        self.buffer.read::<T>(self.offset, self.element_count)
    }

    /// Borrow the view's elements for writing
    pub fn write<T: Element>(&self) -> ForgeResult<TensorMut<'_, T>> {
        self.check_dtype::<T>()?;
        self.buffer.write::<T>(self.offset, self.element_count)
    }

    /// Sub-view of `dims` starting `offset` elements into this view
    pub fn view(&self, offset: usize, dims: &[usize]) -> ForgeResult<Tensor> {
        let count = element_count(dims)?;
        let end = offset.checked_add(count).unwrap_or(usize::MAX);
        if end > self.element_count {
            return Err(ForgeError::OutOfBounds(format!(
                "view {}..{} exceeds tensor of {} elements",
                offset, end, self.element_count
            )));
        }
        Ok(Tensor {
            dtype: self.dtype,
            dims: dims.to_vec(),
            buffer: Rc::clone(&self.buffer),
            offset: self.offset + offset,
            element_count: count,
        })
    }

    /// Same view with a different shape of equal element count
    pub fn reshape(&self, dims: &[usize]) -> ForgeResult<Tensor> {
        let count = element_count(dims)?;
        if count != self.element_count {
            return Err(ForgeError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.dims, dims
            )));
        }
        self.view(0, dims)
    }

    /// Whether both tensors view exactly the same elements of one buffer
    pub fn shares_view_with(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
            && self.offset == other.offset
            && self.element_count == other.element_count
    }

    /// Whether both tensors sit on the same buffer
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Copy the elements into a fresh owning tensor
    pub fn deep_copy(&self, allocator: Arc<dyn Allocator>) -> ForgeResult<Tensor> {
        let copy = Tensor::new(self.dtype, &self.dims, allocator)?;
        let byte_offset = self.offset * self.dtype.size();
        let src = self.buffer.read::<u8>(byte_offset, self.byte_size())?;
        copy.buffer.write::<u8>(0, copy.byte_size())?.copy_from_slice(&src);
        Ok(copy)
    }

    /// Copy the elements out into a `Vec`
    pub fn to_vec<T: Element>(&self) -> ForgeResult<Vec<T>> {
        Ok(self.read::<T>()?.to_vec())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("dims", &self.dims)
            .field("offset", &self.offset)
            .field("owns_memory", &self.owns_memory())
            .finish()
    }
}
