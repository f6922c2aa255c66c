//! Bounded, encrypted activity logs.
//!
//! An [`ActivityLog`] is a ring buffer of [`ActivityEntry`] values persisted
//! through the [`EncryptionService`] after every mutation. When full, the
//! oldest entry is evicted first. Append and persist happen under one lock so
//! concurrent writers never persist an interleaved snapshot.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::types::ActivityEntry;

/// Storage key of the general activity log.
pub const ACTIVITY_LOG_KEY: &str = "security_activity_log";

/// Storage key of the suspicious-activity log.
pub const SUSPICIOUS_ACTIVITIES_KEY: &str = "suspicious_activities";

/// Ring buffer of activity entries with encrypted persistence.
pub struct ActivityLog {
    storage_key: &'static str,
    capacity: usize,
    encryption: Arc<EncryptionService>,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    /// Create an empty log persisted under `storage_key`.
    pub fn new(storage_key: &'static str, capacity: usize, encryption: Arc<EncryptionService>) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage_key,
            capacity,
            encryption,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Load persisted entries in front of anything recorded but not yet persisted.
    ///
    /// Returns the number of entries restored.
    pub async fn load(&self) -> Result<usize, GuardError> {
        let stored: Vec<ActivityEntry> = self
            .encryption
            .secure_retrieve(self.storage_key)
            .await?
            .unwrap_or_default();
        let restored = stored.len();

        let mut entries = self.entries.lock().await;
        let recent: Vec<ActivityEntry> = entries
            .drain(..)
            .filter(|e| !stored.contains(e))
            .collect();
        entries.extend(stored);
        entries.extend(recent);
        Self::trim(&mut entries, self.capacity);

        debug!(key = %self.storage_key, restored, "ActivityLog: loaded");
        Ok(restored)
    }

    /// Append an entry, evict overflow, persist.
    ///
    /// Persistence failures are logged; the in-memory log keeps the entry.
    pub async fn append(&self, entry: ActivityEntry) {
        let mut entries = self.entries.lock().await;
        entries.push_back(entry);
        Self::trim(&mut entries, self.capacity);
        self.persist(&entries).await;
    }

    /// Copy of all entries, oldest first.
    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Count entries of a given kind.
    pub async fn count_kind(&self, kind: &str) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Remove every entry and persist the empty log.
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await;
    }

    fn trim(entries: &mut VecDeque<ActivityEntry>, capacity: usize) {
        while entries.len() > capacity {
            entries.pop_front();
        }
    }

    async fn persist(&self, entries: &VecDeque<ActivityEntry>) {
        if let Err(e) = self.encryption.secure_store(self.storage_key, entries).await {
            warn!(key = %self.storage_key, error = %e, "ActivityLog: failed to persist");
        }
    }
}
