//! Error types for StripeStore
//!
//! This module defines the common error type used by the storage engine
//! and the OSD request pipeline.

use thiserror::Error;

/// Common result type for StripeStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeStore
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch for object {object_number} version {version}: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        object_number: u64,
        version: u64,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt on-disk record: {0}")]
    Corrupt(String),

    #[error("incompatible storage layout version: found {found}, expected {expected}")]
    IncompatibleFormat { found: String, expected: u32 },

    // Request errors
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("stale epoch {received}: current truncate epoch is {current}")]
    StaleEpoch { received: u64, current: u64 },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage stage is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid parameters error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a corrupt record error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if the caller may retry the request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ShuttingDown)
    }
}
