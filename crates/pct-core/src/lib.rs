//! # PCT-Core
//!
//! Core types and utilities for the pose compositional token system:
//! keypoint containers shared between the tokenizer and classifier stages,
//! and the common error taxonomy.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
