//! Error types shared across optmirror crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid size '{input}': {reason}")]
    InvalidSize { input: String, reason: String },

    #[error("Invalid tolerance: {0}")]
    InvalidTolerance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommonError {
    pub fn invalid_size(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSize {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
