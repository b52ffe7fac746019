//! Error types for objbd

use thiserror::Error;

/// Result type for objbd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the volume, caches and translation layer
#[derive(Debug, Error)]
pub enum Error {
    /// Local cache-device I/O failure. Fatal for the write path: once a
    /// journal write fails, the volume stops accepting writes.
    #[error("cache device I/O error: {0}")]
    Device(#[from] std::io::Error),

    /// Object-store failure (read, write or delete of a backend object)
    #[error("backend error: {0}")]
    Backend(String),

    /// Magic/version/UUID mismatch while opening persistent state
    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),

    /// Misaligned or out-of-range request
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Volume not found at the backend
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors that indicate damaged persistent state rather than a
    /// transient I/O condition.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}
