//! Storage trait and errors.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The backing store cannot be used at all (missing, read-only, unsupported).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The store refused a write because it is full.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The key cannot be represented by this backend.
    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    /// A stored entry failed its integrity check.
    #[error("Corrupted entry '{key}': {reason}")]
    Corrupted {
        key: String,
        reason: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Errors that may clear up on their own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::BackendError(_))
    }

    /// Errors after which the module cache stops using the store.
    #[must_use]
    pub const fn disables_cache(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::QuotaExceeded(_))
    }
}

/// A byte-oriented key/value store.
///
/// Writes are last-write-wins per key. Implementations must be safe to share
/// between threads and, for on-disk stores, between processes.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Removes `key`. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Every stored key, sorted.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}
