//! Integration with the `keyring` crate for OS credential storage.
//!
//! The keyring crate provides:
//! - macOS Keychain
//! - Windows Credential Manager
//! - Linux Secret Service (via D-Bus)
//!
//! Each logical key becomes one credential under a shared service name. OS
//! credential stores cannot enumerate by service, so this backend keeps an
//! index credential listing the keys it wrote.

use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use crate::error::KeyringError;
use crate::store::{validate_key, KeyValueStore, StorageBackend};

/// Credential name holding the JSON key index.
const INDEX_KEY: &str = "__wolfguard_index";

/// Store backed by the operating system's credential manager.
pub struct OsKeyringStore {
    /// Service name all credentials are filed under.
    service: String,
    /// Serializes index updates.
    index_lock: tokio::sync::Mutex<()>,
}

impl OsKeyringStore {
    /// Create a store for `service` (e.g. "com.wolf.app").
    pub fn new(service: impl Into<String>) -> Result<Self, KeyringError> {
        let service = service.into();
        // Probe once so a missing credential backend surfaces at startup.
        Entry::new(&service, INDEX_KEY).map_err(|e| KeyringError::InitializationFailed {
            reason: format!("Keyring init failed: {e}"),
        })?;
        Ok(Self {
            service,
            index_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn entry(&self, key: &str) -> Result<Entry, KeyringError> {
        Entry::new(&self.service, key).map_err(|e| KeyringError::storage(e.to_string()))
    }

    fn read(&self, key: &str) -> Result<Option<String>, KeyringError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyringError::read(key, e.to_string())),
        }
    }

    fn read_index(&self) -> Result<Vec<String>, KeyringError> {
        match self.read(INDEX_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, keys: &[String]) -> Result<(), KeyringError> {
        let raw = serde_json::to_string(keys)?;
        self.entry(INDEX_KEY)?
            .set_password(&raw)
            .map_err(|e| KeyringError::storage(format!("Failed to store index: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for OsKeyringStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::OsKeyring
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyringError> {
        self.read(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeyringError> {
        validate_key(key)?;
        let _guard = self.index_lock.lock().await;
        self.entry(key)?
            .set_password(value)
            .map_err(|e| KeyringError::storage(format!("Failed to store {key}: {e}")))?;

        let mut index = self.read_index()?;
        if !index.iter().any(|k| k == key) {
            index.push(key.to_string());
            index.sort();
            self.write_index(&index)?;
        }
        debug!(service = %self.service, key = %key, "OsKeyringStore: stored credential");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KeyringError> {
        let _guard = self.index_lock.lock().await;
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {},
            Err(e) => return Err(KeyringError::storage(format!("Failed to delete {key}: {e}"))),
        }

        let mut index = self.read_index()?;
        let before = index.len();
        index.retain(|k| k != key);
        if index.len() != before {
            self.write_index(&index)?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, KeyringError> {
        self.read_index()
    }
}
