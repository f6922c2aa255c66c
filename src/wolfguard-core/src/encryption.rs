//! Device-bound encryption and secure persistence.
//!
//! Keys are derived from the device fingerprint with PBKDF2 and never leave
//! memory. When the host cannot supply device info the service falls back
//! to a fixed secret; this is a weaker mode, reported by
//! [`EncryptionService::is_fallback_key`], not an error.
//!
//! ## Storage layout
//!
//! Every value written through [`EncryptionService::secure_store`] is JSON,
//! sealed, and stored under `secure_<key>`. Backends only ever see
//! ciphertext.

use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use wolfguard_crypto::{open, seal, KeyMaterial};
use wolfguard_keyring::KeyValueStore;
use zeroize::Zeroizing;

use crate::config::{GuardConfig, KDF_ITERATIONS};
use crate::error::GuardError;
use crate::host::DeviceInfoProvider;
use crate::types::DeviceIdentity;

/// Prefix for every persisted key.
pub const SECURE_PREFIX: &str = "secure_";

/// Key state fixed at initialization.
struct KeyState {
    secret: Zeroizing<String>,
    identity: Option<DeviceIdentity>,
}

/// Device-bound symmetric encryption over a key-value store.
pub struct EncryptionService {
    store: Arc<dyn KeyValueStore>,
    device_info: Arc<dyn DeviceInfoProvider>,
    default_salt: String,
    fallback_secret: String,
    state: OnceCell<KeyState>,
    /// Key for the default salt; keys for other salts are derived per call.
    default_key: OnceLock<KeyMaterial>,
}

impl EncryptionService {
    /// Create an uninitialized service.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        device_info: Arc<dyn DeviceInfoProvider>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            device_info,
            default_salt: config.default_salt.clone(),
            fallback_secret: config.fallback_secret.clone(),
            state: OnceCell::new(),
            default_key: OnceLock::new(),
        }
    }

    /// Collect device info and fix the key secret. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), GuardError> {
        self.state
            .get_or_init(|| async {
                match self.device_info.device_identity().await {
                    Ok(identity) => {
                        info!(platform = %identity.platform, "EncryptionService: device-bound key ready");
                        KeyState {
                            secret: Zeroizing::new(identity.fingerprint()),
                            identity: Some(identity),
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "EncryptionService: device info unavailable, using fallback key");
                        KeyState {
                            secret: Zeroizing::new(self.fallback_secret.clone()),
                            identity: None,
                        }
                    },
                }
            })
            .await;
        Ok(())
    }

    /// Whether `initialize()` has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// Whether keys derive from the fixed fallback secret.
    pub fn is_fallback_key(&self) -> bool {
        self.state.get().map_or(false, |s| s.identity.is_none())
    }

    /// Device identity captured at initialization, if the host supplied one.
    pub fn device_identity(&self) -> Option<&DeviceIdentity> {
        self.state.get().and_then(|s| s.identity.as_ref())
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn key_for(&self, salt: Option<&str>) -> Result<KeyMaterial, GuardError> {
        let state = self.state.get().ok_or(GuardError::NotInitialized {
            component: "EncryptionService",
        })?;
        match salt {
            Some(salt) if salt != self.default_salt => {
                Ok(KeyMaterial::derive(state.secret.as_bytes(), salt.as_bytes(), KDF_ITERATIONS))
            },
            _ => Ok(self
                .default_key
                .get_or_init(|| {
                    debug!("EncryptionService: deriving default key");
                    KeyMaterial::derive(state.secret.as_bytes(), self.default_salt.as_bytes(), KDF_ITERATIONS)
                })
                .clone()),
        }
    }

    /// Whether the default-salt key has been derived and cached.
    pub fn has_cached_default_key(&self) -> bool {
        self.default_key.get().is_some()
    }

    /// Encrypt `data` under the device key for `salt` (default salt if `None`).
    pub fn encrypt(&self, data: &str, salt: Option<&str>) -> Result<String, GuardError> {
        let key = self.key_for(salt)?;
        Ok(seal(&key, data)?)
    }

    /// Decrypt an envelope produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, ciphertext: &str, salt: Option<&str>) -> Result<String, GuardError> {
        let key = self.key_for(salt)?;
        Ok(open(&key, ciphertext)?)
    }

    /// Serialize `value` to JSON and encrypt it.
    pub fn encrypt_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        salt: Option<&str>,
    ) -> Result<String, GuardError> {
        let json = serde_json::to_string(value)
            .map_err(|e| GuardError::validation(format!("cannot serialize value: {e}")))?;
        self.encrypt(&json, salt)
    }

    /// Decrypt and parse JSON. The parse doubles as payload validation.
    pub fn decrypt_json<T: DeserializeOwned>(
        &self,
        ciphertext: &str,
        salt: Option<&str>,
    ) -> Result<T, GuardError> {
        let json = self.decrypt(ciphertext, salt)?;
        serde_json::from_str(&json)
            .map_err(|e| GuardError::validation(format!("decrypted payload is not valid: {e}")))
    }

    /// Encrypt twice: device key first, then the device secret salted with `user_key`.
    ///
    /// Neither pass is authenticated.
    pub fn encrypt_sensitive(&self, data: &str, user_key: &str) -> Result<String, GuardError> {
        let inner = self.encrypt(data, None)?;
        self.encrypt(&inner, Some(user_key))
    }

    /// Reverse [`encrypt_sensitive`](Self::encrypt_sensitive).
    pub fn decrypt_sensitive(&self, ciphertext: &str, user_key: &str) -> Result<String, GuardError> {
        let inner = self.decrypt(ciphertext, Some(user_key))?;
        self.decrypt(&inner, None)
    }

    /// Encrypt and persist `value` under `secure_<key>`.
    pub async fn secure_store<T: Serialize + ?Sized + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), GuardError> {
        let sealed = self.encrypt_json(value, None)?;
        self.store.set(&storage_key(key), &sealed).await?;
        Ok(())
    }

    /// Load and decrypt `secure_<key>`.
    ///
    /// Crypto or parse failures are logged and reported as `None`; only
    /// storage failures surface as errors.
    pub async fn secure_retrieve<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, GuardError> {
        let Some(sealed) = self.store.get(&storage_key(key)).await? else {
            return Ok(None);
        };
        match self.decrypt_json(&sealed, None) {
            Ok(value) => Ok(Some(value)),
            Err(e @ (GuardError::Crypto(_) | GuardError::Validation { .. })) => {
                warn!(key = %key, error = %e, "EncryptionService: stored value unreadable, treating as absent");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Delete `secure_<key>`.
    pub async fn secure_remove(&self, key: &str) -> Result<(), GuardError> {
        self.store.remove(&storage_key(key)).await?;
        Ok(())
    }
}

fn storage_key(key: &str) -> String {
    format!("{SECURE_PREFIX}{key}")
}
