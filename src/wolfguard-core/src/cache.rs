//! Encrypted license cache and offline validation.
//!
//! The last successful online verification is kept as a [`LicenseRecord`]
//! under `license_info`, encrypted by the [`EncryptionService`]. Offline
//! validation runs these checks in order and stops at the first failure:
//!
//! 1. a record exists
//! 2. the license key matches
//! 3. the device id matches
//! 4. now is before the expiry date
//! 5. now is within the grace period after the last online check

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::license::LicenseRecord;

/// Storage key of the cached license record.
pub const LICENSE_INFO_KEY: &str = "license_info";

/// Result of offline validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineCheck {
    /// Record accepted.
    Valid,
    /// Nothing cached yet.
    NoRecord,
    /// Cached record is for another key.
    KeyMismatch,
    /// Cached record is for another device.
    DeviceMismatch,
    /// License past its expiry date.
    Expired,
    /// Too long since the last online check.
    GraceExceeded,
}

impl OfflineCheck {
    /// Whether the license is accepted.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// User-facing message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Valid => "License is valid",
            Self::NoRecord => "No license information found. Please verify the license online.",
            Self::KeyMismatch => "License key does not match",
            Self::DeviceMismatch => "Device id does not match",
            Self::Expired => "License has expired",
            Self::GraceExceeded => {
                "Offline grace period exceeded. Please connect to the internet to verify the license."
            },
        }
    }
}

/// In-memory view of the persisted license record.
pub struct LicenseCache {
    encryption: Arc<EncryptionService>,
    grace: chrono::Duration,
    record: RwLock<Option<LicenseRecord>>,
}

impl LicenseCache {
    /// Create an empty cache with the given offline grace period in days.
    ///
    /// Periods too large to represent saturate.
    pub fn new(encryption: Arc<EncryptionService>, grace_days: i64) -> Self {
        Self {
            encryption,
            grace: chrono::Duration::try_days(grace_days).unwrap_or(chrono::Duration::MAX),
            record: RwLock::new(None),
        }
    }

    /// Read the persisted record into memory.
    pub async fn load(&self) -> Result<Option<LicenseRecord>, GuardError> {
        let stored: Option<LicenseRecord> = self.encryption.secure_retrieve(LICENSE_INFO_KEY).await?;
        debug!(present = stored.is_some(), "LicenseCache: loaded");
        *self.record.write().await = stored.clone();
        Ok(stored)
    }

    /// Current record.
    pub async fn get(&self) -> Option<LicenseRecord> {
        self.record.read().await.clone()
    }

    /// Whether a record is cached.
    pub async fn has_record(&self) -> bool {
        self.record.read().await.is_some()
    }

    /// Persist `record` and make it current.
    pub async fn store(&self, record: LicenseRecord) -> Result<(), GuardError> {
        self.encryption.secure_store(LICENSE_INFO_KEY, &record).await?;
        info!(expiry = %record.expiry_date, "LicenseCache: license record stored");
        *self.record.write().await = Some(record);
        Ok(())
    }

    /// Drop the record from memory and storage.
    pub async fn clear(&self) -> Result<(), GuardError> {
        self.encryption.secure_remove(LICENSE_INFO_KEY).await?;
        *self.record.write().await = None;
        Ok(())
    }

    /// Validate `license_key` on `device_id` against the cached record.
    pub async fn validate_offline(&self, license_key: &str, device_id: &str, now: DateTime<Utc>) -> OfflineCheck {
        let guard = self.record.read().await;
        let Some(record) = guard.as_ref() else {
            return OfflineCheck::NoRecord;
        };
        check_record(record, license_key, device_id, now, self.grace)
    }
}

fn check_record(
    record: &LicenseRecord,
    license_key: &str,
    device_id: &str,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> OfflineCheck {
    if record.license_key != license_key {
        OfflineCheck::KeyMismatch
    } else if record.device_id != device_id {
        OfflineCheck::DeviceMismatch
    } else if now >= record.expiry_date {
        OfflineCheck::Expired
    } else {
        // Unrepresentable deadlines count as exceeded.
        match record.last_online_check_at.checked_add_signed(grace) {
            Some(deadline) if now <= deadline => OfflineCheck::Valid,
            _ => OfflineCheck::GraceExceeded,
        }
    }
}
