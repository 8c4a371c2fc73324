//! Error types for the ledger
//!
//! This module defines the error taxonomy shared by every layer.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors are `Clone` so that a single failure (for example a page that could
//! not be created) can be delivered to every caller queued on it.

use crate::types::PageId;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Error types for the ledger
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Operation on a terminated journal, or commit of a failed explicit journal
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A commit, object, or entry is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// The page does not exist in the ledger
    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    /// Unexpected inconsistency (e.g. ancestor search failure)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Transient failure reported by the storage collaborator
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation was cancelled before completion
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be read or validated
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Create an `IllegalState` error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        LedgerError::IllegalState(message.into())
    }

    /// Create a `NotFound` error
    pub fn not_found(message: impl Into<String>) -> Self {
        LedgerError::NotFound(message.into())
    }

    /// Create an `Internal` error
    pub fn internal(message: impl Into<String>) -> Self {
        LedgerError::Internal(message.into())
    }

    /// Create a `Storage` error without an underlying source
    pub fn storage(message: impl Into<String>) -> Self {
        LedgerError::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create an `InvalidArgument` error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        LedgerError::InvalidArgument(message.into())
    }

    /// Create a `Cancelled` error
    pub fn cancelled(message: impl Into<String>) -> Self {
        LedgerError::Cancelled(message.into())
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage { .. })
    }

    /// Whether this error reports an absent page, commit, or object
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_) | LedgerError::PageNotFound(_))
    }
}

impl From<io::Error> for LedgerError {
    fn from(e: io::Error) -> Self {
        LedgerError::Storage {
            message: e.to_string(),
            source: Some(Arc::new(e)),
        }
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(e: bincode::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}
