//! Error types for StripeCache
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for StripeCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeCache
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("journal device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("journal device not ready: {0}")]
    NotReady(String),

    #[error("journal metadata corrupt: {0}")]
    Corrupt(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Transient conditions
    #[error("journal space below reserve, retry after reclaim")]
    Retry,

    #[error("stripe is already caching or mid-drain")]
    AlreadyCaching,

    // Sticky failures
    #[error("journal device has failed, logging disabled")]
    JournalFailed,

    // Mode control
    #[error("cannot leave write-back mode: {cached} stripes still cached")]
    CacheNotEmpty { cached: usize },

    // Configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a device-not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a corrupt-metadata error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Check if this error is resolved by retrying after reclaim progress
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Check if this error means the journal is permanently unusable and the
    /// caller should fall back to direct, unlogged array writes
    #[must_use]
    pub fn is_journal_failed(&self) -> bool {
        matches!(self, Self::JournalFailed)
    }
}
