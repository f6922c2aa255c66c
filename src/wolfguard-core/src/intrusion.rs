//! Intrusion and abuse detection.
//!
//! Three detectors feed one suspicious-activity log:
//!
//! - **Login throttling**: per-user failed-attempt counter with an idle reset
//! - **Injection heuristics**: SQL, script/XSS and shell metacharacter patterns
//! - **Volumetric detection**: request rate over a caller-measured window
//!
//! Every suspicious entry is handed to the injected [`ResponsePolicy`], which
//! decides what the host should do about it. The decision is stored with the
//! entry under `response`, so detectors that answer with a plain `bool`
//! still leave it for the host to read back. The detectors are heuristics:
//! known-bad patterns are caught, false negatives are expected.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{error, info, warn};

use crate::audit::{ActivityLog, ACTIVITY_LOG_KEY, SUSPICIOUS_ACTIVITIES_KEY};
use crate::config::GuardConfig;
use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::host::Clock;
use crate::types::{ActivityEntry, SuspiciousActivity};

/// Suspicious activity kinds recorded by the detectors.
pub mod kinds {
    /// Failed-login threshold crossed.
    pub const EXCESSIVE_LOGIN_ATTEMPTS: &str = "excessive_login_attempts";
    /// Input matched an injection pattern.
    pub const INJECTION_ATTEMPT: &str = "injection_attempt";
    /// Request rate above threshold.
    pub const BRUTE_FORCE_ATTEMPT: &str = "brute_force_attempt";
    /// Successful login.
    pub const LOGIN_SUCCESS: &str = "login_success";
    /// Failed login.
    pub const LOGIN_FAILURE: &str = "login_failure";
}

// =============================================================================
// Response policy
// =============================================================================

/// What the host should do about a suspicious activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Block further attempts from this user.
    BlockUser {
        /// User to block.
        user_id: String,
    },
    /// Reject the offending request.
    RejectRequest,
    /// Alert only; let the request through.
    Alert,
    /// Nothing to do.
    None,
}

/// Decides the response to a suspicious activity.
pub trait ResponsePolicy: Send + Sync {
    /// Choose an action for `activity`.
    fn respond(&self, activity: &SuspiciousActivity) -> ResponseAction;
}

/// Default policy: log the event and map each kind to a fixed action.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResponsePolicy;

impl ResponsePolicy for LoggingResponsePolicy {
    fn respond(&self, activity: &SuspiciousActivity) -> ResponseAction {
        match activity.kind.as_str() {
            kinds::EXCESSIVE_LOGIN_ATTEMPTS => {
                let user_id = activity.detail_str("userId").unwrap_or_default().to_string();
                error!(user_id = %user_id, "User blocked after excessive login attempts");
                ResponseAction::BlockUser { user_id }
            },
            kinds::INJECTION_ATTEMPT => {
                error!(
                    category = activity.detail_str("category").unwrap_or("unknown"),
                    "Injection attempt detected"
                );
                ResponseAction::RejectRequest
            },
            kinds::BRUTE_FORCE_ATTEMPT => {
                error!(
                    endpoint = activity.detail_str("endpoint").unwrap_or("unknown"),
                    "Brute force attack detected"
                );
                ResponseAction::RejectRequest
            },
            other => {
                warn!(kind = %other, details = %activity.details, "Suspicious activity");
                ResponseAction::Alert
            },
        }
    }
}

// =============================================================================
// Injection patterns
// =============================================================================

/// Pattern family an injection match belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionCategory {
    /// SQL injection markers.
    Sql,
    /// Script tags and script-bearing attributes.
    Xss,
    /// Shell metacharacters followed by a command.
    Command,
}

impl InjectionCategory {
    /// Stable name used in log details.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Xss => "xss",
            Self::Command => "command",
        }
    }
}

struct InjectionPatterns {
    patterns: Vec<(InjectionCategory, Regex)>,
}

static INJECTION_PATTERNS: OnceLock<InjectionPatterns> = OnceLock::new();

impl InjectionPatterns {
    fn get() -> &'static Self {
        INJECTION_PATTERNS.get_or_init(Self::new)
    }

    fn new() -> Self {
        let table: [(InjectionCategory, &str); 9] = [
            // Quote, comment and hash markers.
            (InjectionCategory::Sql, r"(?i)(%27)|(')|(--)|(%23)|(#)"),
            // Assignment followed by a quote, comment or terminator.
            (InjectionCategory::Sql, r"(?i)((%3D)|(=))[^\n]*((%27)|(')|(--)|(%3B)|(;))"),
            // Quote followed by "or".
            (InjectionCategory::Sql, r"(?i)\w*((%27)|('))((%6F)|o|(%4F))((%72)|r|(%52))"),
            (InjectionCategory::Sql, r"(?i)((%27)|('))union"),
            (InjectionCategory::Xss, r"(?is)<script[^>]*>.*?</script>"),
            (InjectionCategory::Xss, r#"(?i)src[\r\n]*=[\r\n]*\\?(?:'[^']*'|"[^"]*")"#),
            (InjectionCategory::Xss, r#"(?i)style[\r\n]*=[\r\n]*\\?(?:'[^']*'|"[^"]*")"#),
            (InjectionCategory::Xss, r#"(?i)onload[\r\n]*=[\r\n]*\\?(?:'[^']*'|"[^"]*")"#),
            (InjectionCategory::Command, r"[;&|`]([a-zA-Z0-9_/.-]+)"),
        ];
        let patterns = table
            .into_iter()
            .map(|(category, pattern)| {
                (category, Regex::new(pattern).expect("valid injection pattern"))
            })
            .collect();
        Self { patterns }
    }

    fn first_match(&self, input: &str) -> Option<(InjectionCategory, &Regex)> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(input))
            .map(|(category, re)| (*category, re))
    }
}

// =============================================================================
// Detector
// =============================================================================

/// Per-user failed-login counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAttemptRecord {
    /// Consecutive failures inside the reset window.
    pub count: u32,
    /// Time of the most recent attempt.
    pub last_attempt_at: DateTime<Utc>,
}

/// Login throttling, injection heuristics and brute-force detection.
pub struct IntrusionDetector {
    clock: Arc<dyn Clock>,
    activity: Arc<ActivityLog>,
    suspicious: ActivityLog,
    attempts: Mutex<HashMap<String, LoginAttemptRecord>>,
    policy: RwLock<Arc<dyn ResponsePolicy>>,
    max_login_attempts: u32,
    reset_window: chrono::Duration,
    brute_force_threshold_rps: f64,
    initialized: OnceCell<()>,
}

impl IntrusionDetector {
    /// Create a detector with the default [`LoggingResponsePolicy`].
    pub fn new(encryption: Arc<EncryptionService>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
        Self {
            clock,
            activity: Arc::new(ActivityLog::new(
                ACTIVITY_LOG_KEY,
                config.activity_log_max_size,
                encryption.clone(),
            )),
            suspicious: ActivityLog::new(SUSPICIOUS_ACTIVITIES_KEY, config.activity_log_max_size, encryption),
            attempts: Mutex::new(HashMap::new()),
            policy: RwLock::new(Arc::new(LoggingResponsePolicy)),
            max_login_attempts: config.max_login_attempts,
            reset_window: chrono::Duration::from_std(config.login_attempt_reset)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            brute_force_threshold_rps: config.brute_force_threshold_rps,
            initialized: OnceCell::new(),
        }
    }

    /// Load both persisted logs. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), GuardError> {
        self.initialized
            .get_or_try_init(|| async {
                let activity = self.activity.load().await?;
                let suspicious = self.suspicious.load().await?;
                info!(activity, suspicious, "IntrusionDetector: initialized");
                Ok::<(), GuardError>(())
            })
            .await?;
        Ok(())
    }

    /// Replace the response policy.
    pub async fn set_response_policy(&self, policy: Arc<dyn ResponsePolicy>) {
        *self.policy.write().await = policy;
    }

    // -------------------------------------------------------------------------
    // Login throttling
    // -------------------------------------------------------------------------

    /// Record a login attempt.
    ///
    /// Returns `false` once the user has reached the failed-attempt limit;
    /// the caller must block further attempts. The suspicious entry is
    /// written only when the limit is first reached.
    pub async fn record_login_attempt(&self, user_id: &str, success: bool, details: Value) -> bool {
        let now = self.clock.now();
        let (count, crossed) = {
            let mut attempts = self.attempts.lock().await;
            let record = attempts
                .entry(user_id.to_string())
                .or_insert(LoginAttemptRecord {
                    count: 0,
                    last_attempt_at: now,
                });
            if now - record.last_attempt_at > self.reset_window {
                record.count = 0;
            }
            let before = record.count;
            record.count = if success { 0 } else { before.saturating_add(1) };
            record.last_attempt_at = now;
            let crossed = !success
                && before < self.max_login_attempts
                && record.count >= self.max_login_attempts;
            (record.count, crossed)
        };

        let details = merge_details(json!({ "userId": user_id, "attempts": count }), details);
        let kind = if success {
            kinds::LOGIN_SUCCESS
        } else {
            kinds::LOGIN_FAILURE
        };
        self.log_activity(kind, details.clone()).await;

        if crossed {
            self.record_suspicious_activity(kinds::EXCESSIVE_LOGIN_ATTEMPTS, details)
                .await;
        }
        success || count < self.max_login_attempts
    }

    /// Forget a user's failed-attempt counter.
    pub async fn reset_login_attempts(&self, user_id: &str) {
        self.attempts.lock().await.remove(user_id);
    }

    /// Current failed-attempt count, honoring the idle reset.
    pub async fn login_attempt_count(&self, user_id: &str) -> u32 {
        let now = self.clock.now();
        self.attempts
            .lock()
            .await
            .get(user_id)
            .filter(|r| now - r.last_attempt_at <= self.reset_window)
            .map_or(0, |r| r.count)
    }

    // -------------------------------------------------------------------------
    // Pattern and volumetric detection
    // -------------------------------------------------------------------------

    /// Check `input` against the injection pattern sets.
    pub async fn detect_injection_attack(&self, input: &str) -> bool {
        let Some((category, pattern)) = InjectionPatterns::get().first_match(input) else {
            return false;
        };
        self.record_suspicious_activity(
            kinds::INJECTION_ATTEMPT,
            json!({
                "input": input,
                "category": category.as_str(),
                "pattern": pattern.as_str(),
            }),
        )
        .await;
        true
    }

    /// Classify `input` without recording anything.
    pub fn classify_injection(input: &str) -> Option<InjectionCategory> {
        InjectionPatterns::get().first_match(input).map(|(c, _)| c)
    }

    /// Flag request bursts above the configured requests-per-second threshold.
    ///
    /// `time_window` is in milliseconds. A zero window with any requests
    /// counts as an infinite rate.
    pub async fn detect_brute_force_attack(&self, request_count: u64, time_window_ms: u64, endpoint: &str) -> bool {
        if request_count == 0 {
            return false;
        }
        let rps = if time_window_ms == 0 {
            f64::INFINITY
        } else {
            request_count as f64 / (time_window_ms as f64 / 1000.0)
        };
        if rps <= self.brute_force_threshold_rps {
            return false;
        }
        // JSON has no infinity.
        let rate = if rps.is_finite() { json!(rps) } else { Value::Null };
        self.record_suspicious_activity(
            kinds::BRUTE_FORCE_ATTEMPT,
            json!({
                "endpoint": endpoint,
                "requestCount": request_count,
                "timeWindow": time_window_ms,
                "requestsPerSecond": rate,
            }),
        )
        .await;
        true
    }

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    /// Append to the activity log.
    pub async fn log_activity(&self, kind: &str, details: Value) {
        self.activity
            .append(ActivityEntry::new(kind, self.clock.now(), details))
            .await;
    }

    /// Apply the response policy and append the entry, with the decision
    /// under `response`, to the suspicious-activity log.
    pub async fn record_suspicious_activity(&self, kind: &str, details: Value) -> ResponseAction {
        let mut entry = ActivityEntry::new(kind, self.clock.now(), details);
        let policy = self.policy.read().await.clone();
        let action = policy.respond(&entry);
        warn!(kind = %kind, action = ?action, "IntrusionDetector: suspicious activity");

        match serde_json::to_value(&action) {
            Ok(response) => {
                entry.details = merge_details(entry.details, json!({ "response": response }));
            },
            Err(e) => warn!(error = %e, "IntrusionDetector: cannot serialize response action"),
        }
        self.suspicious.append(entry).await;
        action
    }

    /// Handle to the activity log for other services to write failures to.
    pub fn shared_activity_log(&self) -> Arc<ActivityLog> {
        self.activity.clone()
    }

    /// Activity log, oldest first.
    pub async fn activity_log(&self) -> Vec<ActivityEntry> {
        self.activity.entries().await
    }

    /// Suspicious-activity log, oldest first.
    pub async fn suspicious_activities(&self) -> Vec<SuspiciousActivity> {
        self.suspicious.entries().await
    }

    /// Empty the suspicious-activity log.
    pub async fn clear_suspicious_activities(&self) {
        self.suspicious.clear().await;
    }
}

/// Merge caller details into `base`; caller keys win, non-objects are nested.
fn merge_details(base: Value, extra: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    match extra {
        Value::Object(map) => merged.extend(map),
        Value::Null => {},
        other => {
            merged.insert("details".into(), other);
        },
    }
    Value::Object(merged)
}
