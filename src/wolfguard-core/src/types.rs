//! Shared data types for the trust layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable attributes of the device the app runs on.
///
/// Collected once per process from the host; immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Platform-assigned device identifier.
    pub uuid: String,
    /// Operating system family ("android", "ios", "linux", ...).
    pub platform: String,
    /// Hardware model.
    pub model: String,
    /// Operating system version.
    pub os_version: String,
    /// Application version.
    pub app_version: String,
    /// Application build number.
    pub build_number: String,
}

impl DeviceIdentity {
    /// Key-derivation input binding keys to this installation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!("{}_{}_{}", self.uuid, self.platform, self.model)
    }

    /// Whether the fields that must never change (id, platform, model) match.
    #[must_use]
    pub fn stable_fields_match(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.platform == other.platform && self.model == other.model
    }

    /// Version string in the form recorded by the integrity baseline.
    #[must_use]
    pub fn full_app_version(&self) -> String {
        format!("{} ({})", self.app_version, self.build_number)
    }
}

/// What the running binary claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    /// Hash of the signing certificate or binary.
    pub signature_hash: String,
    /// Package / bundle id.
    pub package_id: String,
    /// Version string.
    pub version: String,
}

/// One entry in an activity or suspicious-activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Event type, e.g. `login_failure` or `injection_attempt`.
    #[serde(rename = "type")]
    pub kind: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form event details (always a JSON object).
    pub details: serde_json::Value,
}

impl ActivityEntry {
    /// Create an entry; non-object details are wrapped as `{"value": ...}`.
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>, details: serde_json::Value) -> Self {
        let details = match details {
            serde_json::Value::Object(_) => details,
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        Self {
            kind: kind.into(),
            timestamp,
            details,
        }
    }

    /// Read a string field from the details.
    pub fn detail_str(&self, field: &str) -> Option<&str> {
        self.details.get(field).and_then(serde_json::Value::as_str)
    }
}

/// A suspicious-activity entry has the same shape as any other entry.
pub type SuspiciousActivity = ActivityEntry;

/// Foreground / background transitions reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// App became visible and interactive.
    Foreground,
    /// App moved to the background.
    Background,
}

/// Conditions that reach the orchestrator's violation handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// One or more anti-tamper checks failed.
    Tamper {
        /// Names of the failed checks.
        failed_checks: Vec<String>,
    },
    /// License could not be validated online or offline.
    License {
        /// Human-readable reason.
        reason: String,
    },
}

impl Violation {
    /// Human-readable description suitable for a user-facing notice.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Tamper { failed_checks } => format!(
                "A security problem was detected ({}). The app will close to protect your data.",
                failed_checks.join(", ")
            ),
            Self::License { reason } => format!(
                "The app license is no longer valid: {reason}. Please renew the license to continue."
            ),
        }
    }
}

/// Channel background monitors report violations on.
pub type ViolationSender = tokio::sync::mpsc::UnboundedSender<Violation>;

/// Receiving end of [`ViolationSender`].
pub type ViolationReceiver = tokio::sync::mpsc::UnboundedReceiver<Violation>;
