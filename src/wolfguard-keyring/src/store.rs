//! Key-value store trait.
//!
//! This module defines the core [`KeyValueStore`] trait that every storage
//! backend implements. Values are opaque strings; encryption happens one
//! layer up, so backends only ever see ciphertext.

use async_trait::async_trait;

use crate::error::KeyringError;

/// Kind of storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process memory only; lost on exit.
    Memory,
    /// JSON document on the local filesystem.
    File,
    /// Operating system credential store.
    OsKeyring,
}

/// Async string key-value store.
///
/// Implementations must be safe to share across tasks. Each call is atomic
/// with respect to other calls on the same store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend kind.
    fn backend(&self) -> StorageBackend;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, KeyringError>;

    /// Write a value, replacing any existing one.
    async fn set(&self, key: &str, value: &str) -> Result<(), KeyringError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), KeyringError>;

    /// List stored keys.
    async fn keys(&self) -> Result<Vec<String>, KeyringError>;

    /// Check whether a key exists.
    async fn contains(&self, key: &str) -> Result<bool, KeyringError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Reject keys that cannot be stored portably.
pub(crate) fn validate_key(key: &str) -> Result<(), KeyringError> {
    if key.is_empty() {
        return Err(KeyringError::InvalidKey {
            reason: "key is empty".into(),
        });
    }
    if key.chars().any(char::is_control) {
        return Err(KeyringError::InvalidKey {
            reason: format!("key {key:?} contains control characters"),
        });
    }
    Ok(())
}
