//! Memory-mapped weight file for zero-copy access
//!
//! The file is mapped read-only once at load time. Weight tensors alias the
//! mapping through external buffers; each of them holds a reference to the
//! [`WeightFile`], so the mapping stays alive as long as any weight does.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use memmap2::Mmap;

use super::header::ModelHeader;
use crate::error::{io_context, ForgeError, ForgeResult};
use crate::memory::ExternalMemory;
use crate::tensor::{DataType, Tensor};

/// Memory-mapped weight file
#[derive(Debug)]
pub struct WeightFile {
    path: PathBuf,
    _file: File,
    mmap: Mmap,
    header: ModelHeader,
}

impl WeightFile {
    /// Open, map, and parse the header
    pub fn open(path: &Path) -> ForgeResult<Rc<Self>> {
        tracing::debug!("Opening weight file for memory-mapping: {:?}", path);

        let file = File::open(path)
            .map_err(|e| io_context(e, &format!("opening weight file '{}'", path.display())))?;

        // SAFETY: the mapping is only ever read; truncating the file while the
        // model is loaded is outside the supported contract.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            ForgeError::MmapError(format!("'{}': {}", path.display(), e))
        })?;

        tracing::debug!("Memory-mapped weight file: {} bytes", mmap.len());

        let header = ModelHeader::parse(&mmap)?;
        Ok(Rc::new(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            header,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    /// Mapped size in bytes
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    /// Whole f32 elements available after the header
    pub fn weight_elements(&self) -> usize {
        (self.file_size() - ModelHeader::SIZE) / std::mem::size_of::<f32>()
    }

    /// Byte position of weight element `element_offset`
    pub fn byte_offset(element_offset: usize) -> usize {
        ModelHeader::SIZE + element_offset * std::mem::size_of::<f32>()
    }

    /// Read-only f32 tensor of `dims` at weight element `element_offset`
    pub fn tensor_at(self: &Rc<Self>, element_offset: usize, dims: &[usize]) -> ForgeResult<Tensor> {
        let source: Rc<dyn ExternalMemory> = Rc::clone(self) as Rc<dyn ExternalMemory>;
        Tensor::external(DataType::F32, dims, source, Self::byte_offset(element_offset)).map_err(
            |e| match e {
                ForgeError::OutOfBounds(msg) => ForgeError::InvalidModelFile(format!(
                    "weight {:?} at element {} runs past end of '{}': {}",
                    dims,
                    element_offset,
                    self.path.display(),
                    msg
                )),
                other => other,
            },
        )
    }
}

impl ExternalMemory for WeightFile {
    fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Sequential reader over the weight region
///
/// Hands out tensors at the running element offset; the caller advances by
/// the element count each consumer reports.
#[derive(Debug)]
pub struct WeightCursor {
    file: Rc<WeightFile>,
    offset: usize,
}

impl WeightCursor {
    pub fn new(file: Rc<WeightFile>) -> Self {
        Self { file, offset: 0 }
    }

    /// Tensor of `dims` at the current offset, without advancing
    pub fn peek(&self, dims: &[usize]) -> ForgeResult<Tensor> {
        self.file.tensor_at(self.offset, dims)
    }

    pub fn advance(&mut self, elements: usize) {
        self.offset += elements;
    }

    /// Elements consumed so far
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes consumed so far, header included
    pub fn consumed_bytes(&self) -> usize {
        WeightFile::byte_offset(self.offset)
    }

    /// Require every byte of the file to have been consumed
    pub fn finish(&self) -> ForgeResult<()> {
        let consumed = self.consumed_bytes();
        let file_size = self.file.file_size();
        if consumed != file_size {
            return Err(ForgeError::WeightSizeMismatch {
                consumed,
                file_size,
            });
        }
        Ok(())
    }
}
