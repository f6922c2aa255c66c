//! License types and the license verifier.
//!
//! ## Verification flow
//!
//! ```text
//! verify_license(key, force_online)
//!   ├─ online? and (force_online or nothing cached)
//!   │    ├─ POST {licenseKey, deviceInfo} ──► isValid: true  → cache record, OnlineValid
//!   │    │                                └► isValid: false → rejected
//!   │    └─ network error / timeout ───────► offline path
//!   └─ offline path: LicenseCache::validate_offline → OfflineValid | rejected
//! ```
//!
//! With an activity log attached, failed online attempts are logged as
//! `license_check_failed` and every rejection as `license_rejected`.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::audit::ActivityLog;
use crate::cache::{LicenseCache, OfflineCheck};
use crate::config::GuardConfig;
use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::host::{Clock, DeviceInfoProvider, NetworkStatusProvider};
use crate::https::LicenseTransport;
use crate::schedule::PeriodicTask;
use crate::types::{ActivityEntry, DeviceIdentity, Violation, ViolationSender};

/// Expiry assumed when the backend omits one.
pub const DEFAULT_LICENSE_VALIDITY_DAYS: i64 = 365;

/// Activity kind logged when the backend could not be reached or the
/// record could not be cached.
pub const LICENSE_CHECK_FAILED: &str = "license_check_failed";
/// Activity kind logged when a license is rejected.
pub const LICENSE_REJECTED: &str = "license_rejected";

// =============================================================================
// Wire types
// =============================================================================

/// Device description sent with a verification request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoPayload {
    /// Device id.
    pub device_id: String,
    /// Platform.
    pub platform: String,
    /// Hardware model.
    pub model: String,
    /// OS version.
    pub os_version: String,
    /// App version.
    pub app_version: String,
    /// App build number.
    pub build_number: String,
}

impl From<&DeviceIdentity> for DeviceInfoPayload {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            device_id: identity.uuid.clone(),
            platform: identity.platform.clone(),
            model: identity.model.clone(),
            os_version: identity.os_version.clone(),
            app_version: identity.app_version.clone(),
            build_number: identity.build_number.clone(),
        }
    }
}

/// Body of `POST <license_endpoint>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    /// License key being verified.
    pub license_key: String,
    /// Device the license is used on.
    pub device_info: DeviceInfoPayload,
}

/// Backend answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseResponse {
    /// Whether the license is valid.
    pub is_valid: bool,
    /// Backend-defined license details, including `expiryDate`.
    #[serde(default)]
    pub license_info: Option<serde_json::Map<String, serde_json::Value>>,
    /// Optional human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Stored state
// =============================================================================

/// Last successful online verification.
///
/// Serialized as the backend's `licenseInfo` object with `licenseKey`,
/// `deviceId`, `expiryDate` and `lastOnlineCheck` merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    /// Verified key.
    pub license_key: String,
    /// Device the key was verified on.
    pub device_id: String,
    /// License expiry.
    pub expiry_date: DateTime<Utc>,
    /// Time of the online verification.
    #[serde(rename = "lastOnlineCheck")]
    pub last_online_check_at: DateTime<Utc>,
    /// Remaining backend fields, kept opaque.
    #[serde(flatten)]
    pub license_info: serde_json::Map<String, serde_json::Value>,
}

impl LicenseRecord {
    /// Build a record from a positive backend answer.
    pub fn from_response(
        license_key: &str,
        device_id: &str,
        license_info: Option<serde_json::Map<String, serde_json::Value>>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut info = license_info.unwrap_or_default();
        let expiry_date = info
            .remove("expiryDate")
            .and_then(|v| v.as_str().and_then(parse_expiry))
            .unwrap_or_else(|| {
                debug!("LicenseRecord: no usable expiryDate, assuming default validity");
                now + chrono::Duration::days(DEFAULT_LICENSE_VALIDITY_DAYS)
            });
        for reserved in ["licenseKey", "deviceId", "lastOnlineCheck"] {
            info.remove(reserved);
        }

        Self {
            license_key: license_key.to_string(),
            device_id: device_id.to_string(),
            expiry_date,
            last_online_check_at: now,
            license_info: info,
        }
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (end of day).
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

/// Where the verifier currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    /// No successful verification this session.
    Unverified,
    /// Confirmed by the backend.
    OnlineValid,
    /// Accepted from the cached record.
    OfflineValid,
    /// Past expiry or past the offline grace period.
    Expired,
}

/// Which path produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Backend answer.
    Online,
    /// Cached record.
    Offline,
}

/// Outcome of [`LicenseVerifier::verify_license`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseVerdict {
    /// Whether the license is accepted.
    pub is_valid: bool,
    /// Human-readable explanation.
    pub message: String,
    /// Online or offline.
    pub source: VerdictSource,
}

impl LicenseVerdict {
    fn online(is_valid: bool, message: Option<String>) -> Self {
        let message = message.unwrap_or_else(|| {
            if is_valid {
                "License is valid".to_string()
            } else {
                "License is not valid".to_string()
            }
        });
        Self {
            is_valid,
            message,
            source: VerdictSource::Online,
        }
    }

    fn offline(check: OfflineCheck) -> Self {
        Self {
            is_valid: check.is_valid(),
            message: check.message().to_string(),
            source: VerdictSource::Offline,
        }
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// Online/offline license verification with periodic re-checks.
pub struct LicenseVerifier {
    cache: LicenseCache,
    transport: Arc<dyn LicenseTransport>,
    network: Arc<dyn NetworkStatusProvider>,
    device_info: Arc<dyn DeviceInfoProvider>,
    clock: Arc<dyn Clock>,
    state: RwLock<LicenseState>,
    interval: Duration,
    activity: Option<Arc<ActivityLog>>,
    initialized: OnceCell<()>,
    task: Mutex<Option<PeriodicTask>>,
}

impl LicenseVerifier {
    /// Create an uninitialized verifier.
    pub fn new(
        encryption: Arc<EncryptionService>,
        transport: Arc<dyn LicenseTransport>,
        network: Arc<dyn NetworkStatusProvider>,
        device_info: Arc<dyn DeviceInfoProvider>,
        clock: Arc<dyn Clock>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            cache: LicenseCache::new(encryption, config.offline_grace_days),
            transport,
            network,
            device_info,
            clock,
            state: RwLock::new(LicenseState::Unverified),
            interval: config.license_check_interval,
            activity: None,
            initialized: OnceCell::new(),
            task: Mutex::new(None),
        }
    }

    /// Record failed checks and rejections in `log`.
    pub fn with_activity_log(mut self, log: Arc<ActivityLog>) -> Self {
        self.activity = Some(log);
        self
    }

    async fn record(&self, kind: &str, details: Value) {
        if let Some(log) = &self.activity {
            log.append(ActivityEntry::new(kind, self.clock.now(), details)).await;
        }
    }

    /// Load the cached record. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), GuardError> {
        self.initialized
            .get_or_try_init(|| async {
                let record = self.cache.load().await?;
                info!(cached = record.is_some(), "LicenseVerifier: initialized");
                Ok::<(), GuardError>(())
            })
            .await?;
        Ok(())
    }

    /// Whether `initialize()` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Current state.
    pub async fn state(&self) -> LicenseState {
        *self.state.read().await
    }

    /// Key of the cached record, if any.
    pub async fn stored_license_key(&self) -> Option<String> {
        self.cache.get().await.map(|r| r.license_key)
    }

    /// Cached record, if any.
    pub async fn license_record(&self) -> Option<LicenseRecord> {
        self.cache.get().await
    }

    /// Verify `license_key`, online when possible.
    ///
    /// Only fails when called before `initialize()`; every other problem
    /// becomes a rejected verdict.
    #[instrument(skip(self, license_key))]
    pub async fn verify_license(&self, license_key: &str, force_online: bool) -> Result<LicenseVerdict, GuardError> {
        if !self.is_initialized() {
            return Err(GuardError::NotInitialized {
                component: "LicenseVerifier",
            });
        }
        let verdict = if license_key.trim().is_empty() {
            LicenseVerdict {
                is_valid: false,
                message: "License key is empty".to_string(),
                source: VerdictSource::Offline,
            }
        } else {
            self.verify_key(license_key, force_online).await
        };

        if verdict.is_valid {
            info!(source = ?verdict.source, "LicenseVerifier: license accepted");
        } else {
            warn!(source = ?verdict.source, message = %verdict.message, "LicenseVerifier: license rejected");
            self.record(
                LICENSE_REJECTED,
                json!({ "source": verdict.source, "message": verdict.message }),
            )
            .await;
        }
        Ok(verdict)
    }

    async fn verify_key(&self, license_key: &str, force_online: bool) -> LicenseVerdict {
        let connected = self.network.is_connected().await;
        let cached = self.cache.has_record().await;

        if connected && (force_online || !cached) {
            match self.verify_online(license_key).await {
                Ok(verdict) => return verdict,
                Err(e) => {
                    warn!(error = %e, "LicenseVerifier: online verification failed, falling back to offline");
                    self.record(
                        LICENSE_CHECK_FAILED,
                        json!({ "stage": "online", "error": e.to_string() }),
                    )
                    .await;
                },
            }
        } else {
            debug!(connected, cached, "LicenseVerifier: verifying offline");
        }
        self.verify_offline(license_key).await
    }

    async fn verify_online(&self, license_key: &str) -> Result<LicenseVerdict, GuardError> {
        let identity = self.current_identity().await;
        let request = LicenseRequest {
            license_key: license_key.to_string(),
            device_info: identity.as_ref().map(DeviceInfoPayload::from).unwrap_or_default(),
        };

        let response = self.transport.verify(&request).await?;

        if response.is_valid {
            let record = LicenseRecord::from_response(
                license_key,
                &request.device_info.device_id,
                response.license_info,
                self.clock.now(),
            );
            if let Err(e) = self.cache.store(record).await {
                warn!(error = %e, "LicenseVerifier: could not cache license record");
                self.record(
                    LICENSE_CHECK_FAILED,
                    json!({ "stage": "cache", "error": e.to_string() }),
                )
                .await;
            }
            *self.state.write().await = LicenseState::OnlineValid;
        }
        Ok(LicenseVerdict::online(response.is_valid, response.message))
    }

    async fn verify_offline(&self, license_key: &str) -> LicenseVerdict {
        let device_id = self.current_identity().await.map(|d| d.uuid).unwrap_or_default();
        let check = self
            .cache
            .validate_offline(license_key, &device_id, self.clock.now())
            .await;

        let mut state = self.state.write().await;
        match check {
            OfflineCheck::Valid => *state = LicenseState::OfflineValid,
            OfflineCheck::Expired | OfflineCheck::GraceExceeded => *state = LicenseState::Expired,
            _ => {},
        }
        LicenseVerdict::offline(check)
    }

    async fn current_identity(&self) -> Option<DeviceIdentity> {
        match self.device_info.device_identity().await {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "LicenseVerifier: device info unavailable");
                None
            },
        }
    }

    /// Re-verify the stored key online every interval.
    ///
    /// A rejected license is reported as [`Violation::License`].
    pub fn start(self: &Arc<Self>, sink: ViolationSender) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            debug!("LicenseVerifier: already running");
            return;
        }

        let verifier: Weak<Self> = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn("license", self.interval, move || {
            let verifier = verifier.clone();
            let sink = sink.clone();
            async move {
                let Some(verifier) = verifier.upgrade() else {
                    return;
                };
                let Some(key) = verifier.stored_license_key().await else {
                    return;
                };
                match verifier.verify_license(&key, true).await {
                    Ok(verdict) if !verdict.is_valid => {
                        error!(message = %verdict.message, "LicenseVerifier: license no longer valid");
                        if sink.send(Violation::License { reason: verdict.message }).is_err() {
                            warn!("LicenseVerifier: violation receiver gone");
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!(error = %e, "LicenseVerifier: periodic check failed");
                        verifier
                            .record(
                                LICENSE_CHECK_FAILED,
                                json!({ "stage": "periodic", "error": e.to_string() }),
                            )
                            .await;
                    },
                }
            }
        }));
        info!(interval_secs = self.interval.as_secs(), "LicenseVerifier: periodic checks started");
    }

    /// Stop the periodic re-verification.
    pub fn stop_service(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.stop();
            info!("LicenseVerifier: periodic checks stopped");
        }
    }

    /// Whether the periodic re-verification is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, PeriodicTask::is_running)
    }
}
