//! Common error types for droidbox.
//!
//! This crate provides the unified error taxonomy shared across the droidbox
//! crates, so that callers see one consistent set of failure kinds no matter
//! which layer produced them.
//!
//! # Usage
//!
//! ```rust
//! use droidbox_error::CommonError;
//!
//! fn example() -> Result<(), CommonError> {
//!     Err(CommonError::not_found("instance 4f2a9c"))
//! }
//! ```
//!
//! # Crate-Specific Errors
//!
//! Each crate defines its own error type that wraps `CommonError`:
//!
//! ```rust,ignore
//! use droidbox_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MyError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("my specific error: {0}")]
//!     Specific(String),
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
