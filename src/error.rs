//! Unified error handling for QwenForge
//!
//! This module provides a single error type for the whole engine. Errors are
//! grouped into categories that decide how a caller reacts:
//! - Load errors (missing, truncated or malformed weight files)
//! - Invariant violations (shape/precondition failures inside kernels and layers)
//! - Registry errors (named buffer wiring)
//! - Generation errors (position bookkeeping against the KV cache)
//! - User errors (invalid sampling or generation settings)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for QwenForge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Load Errors ==========
    /// Model loading failed
    #[error("Model loading failed: {0}")]
    ModelLoadFailed(String),

    /// Invalid or corrupted weight file
    #[error("Invalid model file: {0}")]
    InvalidModelFile(String),

    /// Weight slicing did not consume exactly the mapped file
    #[error("Weight file size mismatch: consumed {consumed} bytes, file has {file_size} bytes")]
    WeightSizeMismatch { consumed: usize, file_size: usize },

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MmapError(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Tokenizer could not be loaded
    #[error("Tokenizer loading failed: {0}")]
    TokenizerLoadFailed(String),

    // ========== Invariant Violations ==========
    /// Tensor shapes do not agree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Typed access with an element type that differs from the tensor dtype
    #[error("Dtype mismatch: tensor is {actual}, access requested {requested}")]
    DtypeMismatch { actual: String, requested: String },

    /// View or element range outside the underlying buffer
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Token id is not a row of the embedding table
    #[error("Token id {token} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    /// Weight slot index outside the layer's slot table
    #[error("Invalid weight slot {slot} for layer '{layer}'")]
    InvalidSlot { layer: String, slot: usize },

    /// Layer used before its weight slot was populated
    #[error("Layer '{layer}' has no weight in slot {slot}")]
    MissingWeight { layer: String, slot: usize },

    /// Wrong number of input/output tensors for a layer
    #[error("Layer '{layer}' expects {expected_inputs} inputs and {expected_outputs} outputs, got {inputs} and {outputs}")]
    InvalidArity {
        layer: String,
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },

    /// Buffer is already borrowed in a conflicting way
    #[error("Buffer already borrowed: {0}")]
    BufferBorrowed(String),

    /// Write access requested on a read-only (mapped) buffer
    #[error("Buffer is read-only")]
    ReadOnlyBuffer,

    /// Allocator returned no memory for a non-empty request
    #[error("Memory allocation failed: {0} bytes")]
    AllocationFailed(usize),

    // ========== Registry Errors ==========
    /// Key already present in the buffer registry
    #[error("Buffer already registered: {0}")]
    DuplicateBuffer(String),

    /// Key absent from the buffer registry
    #[error("Buffer not registered: {0}")]
    MissingBuffer(String),

    // ========== Generation Errors ==========
    /// Forward position does not follow the KV cache append order
    #[error("Invalid position {pos}: next writable position is {expected}")]
    InvalidPosition { pos: usize, expected: usize },

    /// Position reached the configured context length
    #[error("Context exhausted: position {pos} >= context length {context_length}")]
    ContextExhausted { pos: usize, context_length: usize },

    /// Operation requires a loaded model
    #[error("Model not loaded")]
    ModelNotLoaded,

    // ========== Sampler / Configuration Errors ==========
    /// Empty logits vector
    #[error("Empty logits vector")]
    EmptyLogits,

    /// Invalid temperature value
    #[error("Invalid temperature: {0}. Must be >= 0")]
    InvalidTemperature(f32),

    /// Invalid top_p value
    #[error("Invalid top_p: {0}. Must be in (0, 1]")]
    InvalidTopP(f32),

    /// Tokenizer rejected the text or ids it was given
    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    /// Invalid generation or runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::ModelLoadFailed(_)
            | ForgeError::InvalidModelFile(_)
            | ForgeError::WeightSizeMismatch { .. }
            | ForgeError::MmapError(_)
            | ForgeError::IoError(_)
            | ForgeError::TokenizerLoadFailed(_) => ErrorCategory::Load,

            ForgeError::ShapeMismatch(_)
            | ForgeError::DtypeMismatch { .. }
            | ForgeError::OutOfBounds(_)
            | ForgeError::TokenOutOfRange { .. }
            | ForgeError::InvalidSlot { .. }
            | ForgeError::MissingWeight { .. }
            | ForgeError::InvalidArity { .. }
            | ForgeError::BufferBorrowed(_)
            | ForgeError::ReadOnlyBuffer
            | ForgeError::AllocationFailed(_) => ErrorCategory::Invariant,

            ForgeError::DuplicateBuffer(_) | ForgeError::MissingBuffer(_) => {
                ErrorCategory::Registry
            }

            ForgeError::InvalidPosition { .. }
            | ForgeError::ContextExhausted { .. }
            | ForgeError::ModelNotLoaded => ErrorCategory::Generation,

            ForgeError::EmptyLogits
            | ForgeError::InvalidTemperature(_)
            | ForgeError::InvalidTopP(_)
            | ForgeError::TokenizerError(_)
            | ForgeError::InvalidConfiguration(_) => ErrorCategory::User,
        }
    }

    /// Check if the caller can continue after this error
    ///
    /// A duplicate registry insert leaves the registry untouched, and user
    /// errors only reject the offending settings. Everything else means the
    /// model or the forward pass cannot proceed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ForgeError::DuplicateBuffer(_))
            || matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error reports a violated shape or precondition invariant
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Invariant)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Weight file, mapping or tokenizer problems
    Load,
    /// Kernel or layer precondition violated
    Invariant,
    /// Named buffer wiring problems
    Registry,
    /// Position bookkeeping problems during generation
    Generation,
    /// Invalid user-supplied settings
    User,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Load => write!(f, "Load"),
            ErrorCategory::Invariant => write!(f, "Invariant"),
            ErrorCategory::Registry => write!(f, "Registry"),
            ErrorCategory::Generation => write!(f, "Generation"),
            ErrorCategory::User => write!(f, "User"),
        }
    }
}

// Helper type alias for Results using ForgeError
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create a shape-mismatch invariant error with context
///
/// # Examples
/// ```ignore
/// return Err(invariant_error!("matmul: input {} != weight cols {}", a, b));
/// ```
#[macro_export]
macro_rules! invariant_error {
    ($msg:expr) => {
        $crate::error::ForgeError::ShapeMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::ShapeMismatch(format!($fmt, $($arg)*))
    };
}

/// Create a model load error with context
///
/// # Examples
/// ```ignore
/// return Err(model_error!("failed to read header from {}", path.display()));
/// ```
#[macro_export]
macro_rules! model_error {
    ($msg:expr) => {
        $crate::error::ForgeError::ModelLoadFailed($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::ModelLoadFailed(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
///
/// # Examples
/// ```ignore
/// let file = File::open(path).map_err(|e| io_context(e, "opening weights"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> ForgeError {
    ForgeError::IoError(std::io::Error::new(
        err.kind(),
        format!("{}: {}", msg, err),
    ))
}
