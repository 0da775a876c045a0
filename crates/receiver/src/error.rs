//! Receive error taxonomy.

use depot_storage::StorageError;
use std::fmt;
use std::io;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by a data receiver.
///
/// Every variant except `PreconditionViolation` carries the number of bytes
/// the receiver had accepted when the failure occurred.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("write rejected after {received} bytes: {reason}")]
    Overload { received: u64, reason: String },

    #[error("receive aborted by client after {received} bytes")]
    ClientAborted {
        received: u64,
        #[source]
        source: io::Error,
    },

    #[error("storage failure after {received} bytes: {source}")]
    StorageFailure {
        received: u64,
        #[source]
        source: BoxError,
    },

    #[error("integrity check failed after {received} bytes: {detail}")]
    IntegrityMismatch { received: u64, detail: String },

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
}

/// Coarse classification of a [`ReceiveError`], used for metrics labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiveErrorKind {
    Overload,
    ClientAborted,
    StorageFailure,
    IntegrityMismatch,
    PreconditionViolation,
}

impl ReceiveErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overload => "overload",
            Self::ClientAborted => "client_aborted",
            Self::StorageFailure => "storage_failure",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::PreconditionViolation => "precondition_violation",
        }
    }
}

impl fmt::Display for ReceiveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an I/O error means the remote peer went away.
pub fn is_client_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

impl ReceiveError {
    pub fn kind(&self) -> ReceiveErrorKind {
        match self {
            Self::Overload { .. } => ReceiveErrorKind::Overload,
            Self::ClientAborted { .. } => ReceiveErrorKind::ClientAborted,
            Self::StorageFailure { .. } => ReceiveErrorKind::StorageFailure,
            Self::IntegrityMismatch { .. } => ReceiveErrorKind::IntegrityMismatch,
            Self::PreconditionViolation(_) => ReceiveErrorKind::PreconditionViolation,
        }
    }

    /// Bytes accepted before the failure, when known.
    pub fn received(&self) -> Option<u64> {
        match self {
            Self::Overload { received, .. }
            | Self::ClientAborted { received, .. }
            | Self::StorageFailure { received, .. }
            | Self::IntegrityMismatch { received, .. } => Some(*received),
            Self::PreconditionViolation(_) => None,
        }
    }

    /// Classify an I/O failure as a client disconnect or a storage failure.
    pub fn from_io(err: io::Error, received: u64) -> Self {
        if is_client_disconnect(&err) {
            Self::ClientAborted {
                received,
                source: err,
            }
        } else {
            Self::StorageFailure {
                received,
                source: Box::new(err),
            }
        }
    }

    /// Classify an object-store failure. Only failures reading the upload
    /// source can be client disconnects.
    pub fn from_storage(err: StorageError, received: u64) -> Self {
        match err {
            StorageError::Source(source) => Self::from_io(source, received),
            other => Self::StorageFailure {
                received,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn mismatch(received: u64, detail: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            received,
            detail: detail.into(),
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }
}

/// Result type for receive operations.
pub type ReceiveResult<T> = std::result::Result<T, ReceiveError>;
