//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading the caller-supplied upload source failed.
    /// Kept apart from `Io` so callers can tell a dropped client from a failing store.
    #[error("failed to read upload source: {0}")]
    Source(#[source] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid upload state: {0}")]
    UploadState(String),

    #[error("checksum unavailable: {0}")]
    Checksum(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
