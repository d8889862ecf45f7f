//! MLP (multi-layer perceptron) operations
//!
//! CPU kernels for the gated feed-forward block:
//! - RMSNorm normalization
//! - SwiGLU activation

pub mod kernels;

pub use kernels::{rmsnorm, rmsnorm_in_place, swiglu, swiglu_in_place, RMS_NORM_EPS};
