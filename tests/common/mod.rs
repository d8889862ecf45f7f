//! Shared fixtures for integration tests
//!
//! - [`fixtures`] writes small synthetic weight files
//! - [`reference`] is a straightforward forward pass used as an oracle
//! - [`tempfile_helpers`] wraps tempfile with error context

#![allow(dead_code)]

pub mod fixtures;
pub mod reference;
pub mod tempfile_helpers;

pub use fixtures::*;
pub use reference::ReferenceModel;
pub use tempfile_helpers::*;

/// Largest absolute difference between two equally long slices
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
