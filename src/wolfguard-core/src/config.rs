//! Configuration for the trust layer.
//!
//! Constants are the fixed policy values hosts may rely on; [`GuardConfig`]
//! carries everything a deployment is allowed to override.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// Failed logins before the user is blocked.
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;
/// Idle time after which the failed-login counter restarts.
pub const LOGIN_ATTEMPT_RESET_TIME: Duration = Duration::from_secs(30 * 60);
/// Entries kept in each activity ring buffer.
pub const ACTIVITY_LOG_MAX_SIZE: usize = 100;
/// Anti-tamper check period.
pub const SECURITY_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Largest tolerated difference between local and trusted time.
pub const MAX_ALLOWED_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
/// Days offline validation is trusted after the last online check.
pub const OFFLINE_GRACE_PERIOD_DAYS: i64 = 7;
/// Largest configurable offline grace period.
pub const MAX_OFFLINE_GRACE_DAYS: i64 = 3650;
/// TOTP time step.
pub const TOTP_STEP: Duration = Duration::from_secs(30);
/// TOTP code length.
pub const TOTP_DIGITS: u32 = 6;
/// License re-verification period.
pub const LICENSE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Requests per second above which traffic counts as brute force.
pub const BRUTE_FORCE_THRESHOLD_RPS: f64 = 10.0;
/// Recovery codes issued per batch.
pub const RECOVERY_CODE_COUNT: usize = 10;
/// Characters per recovery code.
pub const RECOVERY_CODE_LENGTH: usize = 10;
/// PBKDF2 iterations for device keys.
pub const KDF_ITERATIONS: u32 = wolfguard_crypto::DEFAULT_ITERATIONS;
/// Random bytes in a TOTP secret.
pub const TOTP_SECRET_BYTES: usize = 20;

/// Configuration for WolfGuard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// License verification endpoint.
    pub license_endpoint: String,
    /// Per-request timeout for the license endpoint.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Anti-tamper check period.
    #[serde(with = "duration_secs")]
    pub security_check_interval: Duration,
    /// License re-verification period.
    #[serde(with = "duration_secs")]
    pub license_check_interval: Duration,
    /// Delay between a violation and the termination request.
    #[serde(with = "duration_secs")]
    pub termination_delay: Duration,
    /// Largest tolerated clock skew against the trusted time source.
    #[serde(with = "duration_secs")]
    pub max_clock_skew: Duration,
    /// Offline grace period in days.
    pub offline_grace_days: i64,
    /// Failed logins before blocking.
    pub max_login_attempts: u32,
    /// Idle time that resets the failed-login counter.
    #[serde(with = "duration_secs")]
    pub login_attempt_reset: Duration,
    /// Ring buffer capacity for activity logs.
    pub activity_log_max_size: usize,
    /// Brute-force threshold in requests per second.
    pub brute_force_threshold_rps: f64,
    /// Default salt for device key derivation.
    pub default_salt: String,
    /// Secret used when device info is unavailable.
    pub fallback_secret: String,
    /// Issuer shown in authenticator apps.
    pub issuer: String,
    /// Expected application package id.
    pub app_package: String,
    /// Expected signing-certificate hash; `None` trusts the first-run baseline.
    pub expected_signature: Option<String>,
    /// Directory for the file store.
    pub storage_dir: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            license_endpoint: "https://api.wolfapp.com/license/verify".into(),
            request_timeout: Duration::from_secs(10),
            security_check_interval: SECURITY_CHECK_INTERVAL,
            license_check_interval: LICENSE_CHECK_INTERVAL,
            termination_delay: Duration::from_secs(2),
            max_clock_skew: MAX_ALLOWED_CLOCK_SKEW,
            offline_grace_days: OFFLINE_GRACE_PERIOD_DAYS,
            max_login_attempts: MAX_LOGIN_ATTEMPTS,
            login_attempt_reset: LOGIN_ATTEMPT_RESET_TIME,
            activity_log_max_size: ACTIVITY_LOG_MAX_SIZE,
            brute_force_threshold_rps: BRUTE_FORCE_THRESHOLD_RPS,
            default_salt: "WOLF_DEFAULT_SALT".into(),
            fallback_secret: "WOLF_SECURE_ENCRYPTION_KEY_DO_NOT_MODIFY".into(),
            issuer: "WOLF App".into(),
            app_package: "com.wolf.app".into(),
            expected_signature: None,
            storage_dir: None,
        }
    }
}

impl GuardConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GuardError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| GuardError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| GuardError::Config {
            message: format!("invalid config {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a guard outright.
    pub fn validate(&self) -> Result<(), GuardError> {
        let fail = |message: &str| {
            Err(GuardError::Config {
                message: message.to_string(),
            })
        };
        if self.max_login_attempts == 0 {
            return fail("max_login_attempts must be at least 1");
        }
        if self.activity_log_max_size == 0 {
            return fail("activity_log_max_size must be at least 1");
        }
        if !(0..=MAX_OFFLINE_GRACE_DAYS).contains(&self.offline_grace_days) {
            return fail("offline_grace_days must be between 0 and 3650");
        }
        if self.brute_force_threshold_rps <= 0.0 {
            return fail("brute_force_threshold_rps must be positive");
        }
        if self.security_check_interval.is_zero() || self.license_check_interval.is_zero() {
            return fail("check intervals must be non-zero");
        }
        if self.fallback_secret.is_empty() || self.default_salt.is_empty() {
            return fail("fallback_secret and default_salt must not be empty");
        }
        Ok(())
    }
}

/// Durations as whole seconds in JSON.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
