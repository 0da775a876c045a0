//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
