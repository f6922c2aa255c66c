//! TOTP two-factor authentication.
//!
//! Per-user state machine: `Disabled -> Enabled(secret) -> Disabled`.
//!
//! | Key | Value |
//! |-----|-------|
//! | `totp_secret_<user>` | [`TotpSecret`] |
//! | `user_pref_<user>_2fa_enabled` | `bool` |
//! | `user_pref_<user>_recovery_codes` | `Vec<String>` |
//!
//! All three are sealed by the [`EncryptionService`]. Codes are checked
//! against steps T-1, T and T+1 to absorb clock drift; every comparison is
//! constant-time and all three candidates are always computed.
//!
//! Rejected codes are appended to the activity log when one is attached
//! with [`TwoFactorAuthenticator::with_activity_log`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};
use wolfguard_crypto::{
    constant_time_eq, decode_base32, generate_alphanumeric, generate_base32_secret,
    totp_at_counter, TotpParams,
};

use crate::config::{
    GuardConfig, RECOVERY_CODE_COUNT, RECOVERY_CODE_LENGTH, TOTP_DIGITS, TOTP_SECRET_BYTES,
    TOTP_STEP,
};
use crate::audit::ActivityLog;
use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::host::Clock;
use crate::types::ActivityEntry;

/// Activity kind logged when a TOTP code is rejected.
pub const TOTP_FAILURE: &str = "totp_failure";
/// Activity kind logged when a recovery code is rejected.
pub const RECOVERY_CODE_FAILURE: &str = "recovery_code_failure";

/// A user's TOTP secret as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpSecret {
    /// Owner.
    pub user_id: String,
    /// Base32 secret (no padding).
    pub secret: String,
    /// When 2FA was enabled.
    pub created_at: DateTime<Utc>,
}

/// Result of enabling 2FA, shown once for QR enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    /// Base32 secret.
    pub secret: String,
    /// `otpauth://` URI for authenticator apps.
    pub provisioning_uri: String,
}

fn secret_key(user_id: &str) -> String {
    format!("totp_secret_{user_id}")
}

fn pref_key(user_id: &str, pref: &str) -> String {
    format!("user_pref_{user_id}_{pref}")
}

type UserLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Held per-user lock; the map entry goes away with the last holder.
struct UserLock<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

/// TOTP secrets, code verification and recovery codes.
pub struct TwoFactorAuthenticator {
    encryption: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
    issuer: String,
    params: TotpParams,
    /// Serializes read-modify-write per user.
    user_locks: UserLocks,
    activity: Option<Arc<ActivityLog>>,
    initialized: OnceCell<()>,
}

impl TwoFactorAuthenticator {
    /// Create an authenticator issuing codes for `config.issuer`.
    pub fn new(encryption: Arc<EncryptionService>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
        Self {
            encryption,
            clock,
            issuer: config.issuer.clone(),
            params: TotpParams {
                step_secs: TOTP_STEP.as_secs(),
                digits: TOTP_DIGITS,
            },
            user_locks: StdMutex::new(HashMap::new()),
            activity: None,
            initialized: OnceCell::new(),
        }
    }

    /// Record rejected codes in `log`.
    pub fn with_activity_log(mut self, log: Arc<ActivityLog>) -> Self {
        self.activity = Some(log);
        self
    }

    /// Mark ready. Requires an initialized [`EncryptionService`].
    pub async fn initialize(&self) -> Result<(), GuardError> {
        if !self.encryption.is_initialized() {
            return Err(GuardError::NotInitialized {
                component: "EncryptionService",
            });
        }
        if self.initialized.set(()).is_ok() {
            info!(issuer = %self.issuer, "TwoFactorAuthenticator: initialized");
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), GuardError> {
        if self.initialized.initialized() {
            Ok(())
        } else {
            Err(GuardError::NotInitialized {
                component: "TwoFactorAuthenticator",
            })
        }
    }

    async fn lock_user(&self, user_id: &str) -> UserLock<'_> {
        let lock = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_default()
            .clone();
        // Built before awaiting so a cancelled wait still cleans up.
        let mut held = UserLock {
            locks: &self.user_locks,
            user_id: user_id.to_string(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    /// Users with a lock entry in flight.
    pub fn locked_user_count(&self) -> usize {
        self.user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn record_rejection(&self, kind: &str, user_id: &str, reason: &str) {
        debug!(user_id = %user_id, kind, reason, "Code rejected");
        if let Some(log) = &self.activity {
            log.append(ActivityEntry::new(
                kind,
                self.clock.now(),
                json!({ "userId": user_id, "reason": reason }),
            ))
            .await;
        }
    }

    // -------------------------------------------------------------------------
    // Enrollment
    // -------------------------------------------------------------------------

    /// Generate and store a fresh secret, mark the user enabled.
    pub async fn enable_2fa(&self, user_id: &str) -> Result<Enrollment, GuardError> {
        self.ensure_ready()?;
        let _lock = self.lock_user(user_id).await;

        let secret = generate_base32_secret(TOTP_SECRET_BYTES)?;
        let record = TotpSecret {
            user_id: user_id.to_string(),
            secret: secret.clone(),
            created_at: self.clock.now(),
        };
        self.encryption.secure_store(&secret_key(user_id), &record).await?;
        self.encryption
            .secure_store(&pref_key(user_id, "2fa_enabled"), &true)
            .await?;

        info!(user_id = %user_id, "2FA enabled");
        Ok(Enrollment {
            provisioning_uri: self.provisioning_uri(user_id, &secret, None),
            secret,
        })
    }

    /// Whether 2FA is enabled for `user_id`.
    pub async fn is_2fa_enabled(&self, user_id: &str) -> Result<bool, GuardError> {
        self.ensure_ready()?;
        Ok(self
            .encryption
            .secure_retrieve::<bool>(&pref_key(user_id, "2fa_enabled"))
            .await?
            .unwrap_or(false))
    }

    /// Erase the secret, the enabled flag and any recovery codes.
    pub async fn disable_2fa(&self, user_id: &str) -> Result<(), GuardError> {
        self.ensure_ready()?;
        let _lock = self.lock_user(user_id).await;

        self.encryption.secure_remove(&secret_key(user_id)).await?;
        self.encryption
            .secure_remove(&pref_key(user_id, "2fa_enabled"))
            .await?;
        self.encryption
            .secure_remove(&pref_key(user_id, "recovery_codes"))
            .await?;
        info!(user_id = %user_id, "2FA disabled");
        Ok(())
    }

    /// Build an `otpauth://` URI. `issuer` defaults to the configured issuer.
    pub fn provisioning_uri(&self, user_id: &str, secret: &str, issuer: Option<&str>) -> String {
        let issuer = encode_uri_component(issuer.unwrap_or(&self.issuer));
        format!(
            "otpauth://totp/{issuer}:{user}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={digits}&period={period}",
            user = encode_uri_component(user_id),
            secret = encode_uri_component(secret),
            digits = self.params.digits,
            period = self.params.step_secs,
        )
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check a 6-digit code against steps T-1, T and T+1.
    ///
    /// Malformed codes and users without a secret yield `Ok(false)`.
    pub async fn verify_totp(&self, user_id: &str, code: &str) -> Result<bool, GuardError> {
        self.ensure_ready()?;
        if !self.params.is_well_formed(code) {
            self.record_rejection(TOTP_FAILURE, user_id, "malformed").await;
            return Ok(false);
        }

        let Some(record) = self
            .encryption
            .secure_retrieve::<TotpSecret>(&secret_key(user_id))
            .await?
        else {
            self.record_rejection(TOTP_FAILURE, user_id, "not_enabled").await;
            return Ok(false);
        };

        let key = match decode_base32(&record.secret) {
            Ok(key) => key,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Stored TOTP secret is unusable");
                self.record_rejection(TOTP_FAILURE, user_id, "unusable_secret").await;
                return Ok(false);
            },
        };

        let counter = self.params.counter_at(self.clock.now().timestamp());
        let mut matched = false;
        for candidate in [counter.checked_sub(1), Some(counter), counter.checked_add(1)]
            .into_iter()
            .flatten()
        {
            let expected = totp_at_counter(&key, candidate, &self.params)?;
            matched |= constant_time_eq(expected.as_bytes(), code.as_bytes());
        }

        if !matched {
            self.record_rejection(TOTP_FAILURE, user_id, "no_match").await;
        }
        Ok(matched)
    }

    // -------------------------------------------------------------------------
    // Recovery codes
    // -------------------------------------------------------------------------

    /// Replace the user's recovery codes with `count` fresh ones.
    pub async fn generate_recovery_codes(&self, user_id: &str, count: Option<usize>) -> Result<Vec<String>, GuardError> {
        self.ensure_ready()?;
        let count = count.unwrap_or(RECOVERY_CODE_COUNT);
        let _lock = self.lock_user(user_id).await;

        let codes: Vec<String> = (0..count)
            .map(|_| generate_alphanumeric(RECOVERY_CODE_LENGTH))
            .collect();
        self.encryption
            .secure_store(&pref_key(user_id, "recovery_codes"), &codes)
            .await?;
        info!(user_id = %user_id, count, "Recovery codes generated");
        Ok(codes)
    }

    /// Consume a recovery code. Each code verifies at most once.
    pub async fn verify_recovery_code(&self, user_id: &str, code: &str) -> Result<bool, GuardError> {
        self.ensure_ready()?;
        if code.len() != RECOVERY_CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            self.record_rejection(RECOVERY_CODE_FAILURE, user_id, "malformed").await;
            return Ok(false);
        }

        let _lock = self.lock_user(user_id).await;

        let key = pref_key(user_id, "recovery_codes");
        let Some(mut codes) = self.encryption.secure_retrieve::<Vec<String>>(&key).await? else {
            self.record_rejection(RECOVERY_CODE_FAILURE, user_id, "no_codes").await;
            return Ok(false);
        };

        let mut position = None;
        for (i, stored) in codes.iter().enumerate() {
            if constant_time_eq(stored.as_bytes(), code.as_bytes()) && position.is_none() {
                position = Some(i);
            }
        }
        let Some(i) = position else {
            self.record_rejection(RECOVERY_CODE_FAILURE, user_id, "unknown").await;
            return Ok(false);
        };

        codes.remove(i);
        self.encryption.secure_store(&key, &codes).await?;
        info!(user_id = %user_id, remaining = codes.len(), "Recovery code consumed");
        Ok(true)
    }

    /// Number of unused recovery codes.
    pub async fn remaining_recovery_codes(&self, user_id: &str) -> Result<usize, GuardError> {
        self.ensure_ready()?;
        Ok(self
            .encryption
            .secure_retrieve::<Vec<String>>(&pref_key(user_id, "recovery_codes"))
            .await?
            .map_or(0, |codes| codes.len()))
    }
}

/// Percent-encode everything outside the URI-component unreserved set.
fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
