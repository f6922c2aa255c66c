//! File-backed store.
//!
//! All entries live in one JSON object on disk (`store.json` inside the
//! configured directory). Every mutation rewrites the document through a
//! temporary file and an atomic rename, so a crash never leaves a half
//! written store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::KeyringError;
use crate::store::{validate_key, KeyValueStore, StorageBackend};

/// Default document name inside the store directory.
pub const STORE_FILE_NAME: &str = "store.json";

/// Store persisted as a single JSON document.
#[derive(Debug)]
pub struct FileStore {
    /// Path of the JSON document.
    path: PathBuf,
    /// Cached document; the lock also serializes writers.
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or create) a store in `dir`.
    ///
    /// An unreadable or corrupt document is logged and replaced by an empty
    /// store rather than failing startup.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, KeyringError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| KeyringError::InitializationFailed {
                reason: format!("cannot create {}: {e}", dir.display()),
            })?;

        let path = dir.join(STORE_FILE_NAME);
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(entries) => {
                    debug!(path = %path.display(), count = entries.len(), "FileStore: loaded");
                    entries
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "FileStore: corrupt document, starting empty");
                    BTreeMap::new()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(KeyringError::InitializationFailed {
                    reason: format!("cannot read {}: {e}", path.display()),
                })
            },
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), KeyringError> {
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::File
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyringError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeyringError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&entries).await {
            // Keep memory consistent with disk.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KeyringError> {
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(key) {
            if let Err(e) = self.flush(&entries).await {
                entries.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, KeyringError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}
