//! Error types for beatcache
//!
//! This module defines the common error type used by the cache engine,
//! its collaborators and the admin binary.

use thiserror::Error;

/// Common result type for beatcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for beatcache
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Persisted state errors
    #[error("unknown state file version: {found:?}")]
    UnknownStateVersion { found: String },

    #[error("unsupported state record size: {size} bytes (need at least {min})")]
    UnsupportedRecordSize { size: u8, min: u8 },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Download errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("download failed: {0}")]
    Download(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a non-retryable download error
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ServiceUnavailable(_) | Self::ConnectionFailed(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ArchiveNotFound(_) => true,
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
