//! Error types for storage operations.

use thiserror::Error;

/// Errors that can occur during key-value storage operations.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Backend could not be opened.
    #[error("Initialization failed: {reason}")]
    InitializationFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Reading a value failed.
    #[error("Read failed for {key}: {reason}")]
    ReadFailed {
        /// Key being read.
        key: String,
        /// Reason for the failure.
        reason: String,
    },

    /// Writing or removing a value failed.
    #[error("Storage failed: {reason}")]
    StorageFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid key name.
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Operation not supported by this backend.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },
}

impl KeyringError {
    /// Create a storage error from a reason.
    #[must_use]
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFailed {
            reason: reason.into(),
        }
    }

    /// Create a read error for a key.
    #[must_use]
    pub fn read(key: &str, reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for KeyringError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageFailed {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for KeyringError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
