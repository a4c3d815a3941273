//! Error types for Cutline Core.

use thiserror::Error;

/// Core errors raised by encoding and identifier parsing.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid snapshot id: {0}")]
    InvalidSnapshotId(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
