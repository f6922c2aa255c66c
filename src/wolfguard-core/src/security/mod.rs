//! Runtime anti-tamper monitoring.
//!
//! The [`AntiTamperMonitor`] runs six checks, every one of them on every
//! pass even when an earlier one already failed:
//!
//! | Check           | Fails when                                                   |
//! |-----------------|--------------------------------------------------------------|
//! | `app_integrity` | signature, package or version differs from the baseline      |
//! | `root`          | the environment probe reports a rooted/jailbroken device     |
//! | `debugger`      | the environment probe reports an attached debugger           |
//! | `clock_skew`    | local clock is more than the allowed skew off trusted time   |
//! | `emulator`      | the environment probe reports an emulator                    |
//! | `device_drift`  | device id, platform or model changed since initialization    |
//!
//! A check whose host capability errors is recorded as skipped and counts as
//! passing, so a flaky sensor cannot lock users out. Only a definite
//! detection fails the report.
//!
//! ## Integrity baseline
//!
//! The first run stores `{signature, package, version, installTime}` under
//! `app_integrity_info` and passes. Later runs compare against it.

mod anti_tamper;
mod platform;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::host::{AppIdentityProvider, Clock, DeviceInfoProvider, EnvironmentProbe, TrustedTimeSource};
use crate::schedule::PeriodicTask;
use crate::types::{AppIdentity, DeviceIdentity, Violation, ViolationSender};

pub use anti_tamper::{PassiveProbe, ProcStatusProbe};
pub use platform::{ExecutableIdentity, HostDeviceInfo, DEVICE_ID_ENV};

/// Storage key of the integrity baseline.
pub const INTEGRITY_INFO_KEY: &str = "app_integrity_info";

/// One anti-tamper check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityCheck {
    /// Signature, package and version against the baseline.
    AppIntegrity,
    /// Rooted or jailbroken device.
    Root,
    /// Attached debugger.
    Debugger,
    /// Local clock against trusted time.
    ClockSkew,
    /// Emulator or simulator.
    Emulator,
    /// Device identity against the session baseline.
    DeviceDrift,
}

impl SecurityCheck {
    /// Every check, in execution order.
    pub const ALL: [Self; 6] = [
        Self::AppIntegrity,
        Self::Root,
        Self::Debugger,
        Self::ClockSkew,
        Self::Emulator,
        Self::DeviceDrift,
    ];

    /// Stable name used in logs and violations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppIntegrity => "app_integrity",
            Self::Root => "root",
            Self::Debugger => "debugger",
            Self::ClockSkew => "clock_skew",
            Self::Emulator => "emulator",
            Self::DeviceDrift => "device_drift",
        }
    }
}

impl fmt::Display for SecurityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Nothing detected.
    Passed,
    /// Tampering detected.
    Failed {
        /// What was detected.
        reason: String,
    },
    /// Could not run; counts as passing.
    Skipped {
        /// Why the check did not run.
        reason: String,
    },
}

impl CheckOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into() }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }

    /// Whether this outcome fails the report.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Which check.
    pub check: SecurityCheck,
    /// What happened.
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

/// Result of one full pass.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityCheckReport {
    /// When the pass ran.
    pub checked_at: DateTime<Utc>,
    /// One result per check, in execution order.
    pub results: Vec<CheckResult>,
}

impl SecurityCheckReport {
    /// Whether no check failed.
    pub fn passed(&self) -> bool {
        !self.results.iter().any(|r| r.outcome.is_failure())
    }

    /// Checks that failed.
    pub fn failed_checks(&self) -> Vec<SecurityCheck> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_failure())
            .map(|r| r.check)
            .collect()
    }

    /// Outcome of a specific check.
    pub fn outcome(&self, check: SecurityCheck) -> Option<&CheckOutcome> {
        self.results.iter().find(|r| r.check == check).map(|r| &r.outcome)
    }

    /// Violation describing the failed checks, if any.
    pub fn violation(&self) -> Option<Violation> {
        let failed = self.failed_checks();
        (!failed.is_empty()).then(|| Violation::Tamper {
            failed_checks: failed.iter().map(|c| c.as_str().to_string()).collect(),
        })
    }
}

/// First-run snapshot of the application identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityBaseline {
    /// Signing-certificate or binary hash.
    #[serde(rename = "signature")]
    pub signature_hash: String,
    /// Package / bundle id.
    #[serde(rename = "package")]
    pub package_id: String,
    /// Version string, `"<version> (<build>)"`.
    pub version: String,
    /// When the baseline was recorded.
    #[serde(rename = "installTime")]
    pub installed_at: DateTime<Utc>,
}

impl IntegrityBaseline {
    fn capture(identity: &AppIdentity, at: DateTime<Utc>) -> Self {
        Self {
            signature_hash: identity.signature_hash.clone(),
            package_id: identity.package_id.clone(),
            version: identity.version.clone(),
            installed_at: at,
        }
    }

    fn mismatch(&self, identity: &AppIdentity) -> Option<&'static str> {
        if self.signature_hash != identity.signature_hash {
            Some("signature changed")
        } else if self.package_id != identity.package_id {
            Some("package changed")
        } else if self.version != identity.version {
            Some("version changed")
        } else {
            None
        }
    }
}

/// Periodic runtime integrity checker.
pub struct AntiTamperMonitor {
    encryption: Arc<EncryptionService>,
    device_info: Arc<dyn DeviceInfoProvider>,
    app_identity: Arc<dyn AppIdentityProvider>,
    probe: Arc<dyn EnvironmentProbe>,
    time_source: Option<Arc<dyn TrustedTimeSource>>,
    clock: Arc<dyn Clock>,
    expected_signature: Option<String>,
    expected_package: String,
    max_skew: chrono::Duration,
    interval: Duration,
    /// Device identity at initialization; `None` inside when unavailable.
    baseline_identity: OnceCell<Option<DeviceIdentity>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl AntiTamperMonitor {
    /// Create an uninitialized monitor.
    pub fn new(
        encryption: Arc<EncryptionService>,
        device_info: Arc<dyn DeviceInfoProvider>,
        app_identity: Arc<dyn AppIdentityProvider>,
        probe: Arc<dyn EnvironmentProbe>,
        clock: Arc<dyn Clock>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            encryption,
            device_info,
            app_identity,
            probe,
            time_source: None,
            clock,
            expected_signature: config.expected_signature.clone(),
            expected_package: config.app_package.clone(),
            max_skew: chrono::Duration::from_std(config.max_clock_skew)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            interval: config.security_check_interval,
            baseline_identity: OnceCell::new(),
            task: Mutex::new(None),
        }
    }

    /// Enable the clock-skew check against `source`.
    pub fn with_time_source(mut self, source: Arc<dyn TrustedTimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Capture the device baseline and record the integrity baseline if absent.
    pub async fn initialize(&self) -> Result<(), GuardError> {
        if !self.encryption.is_initialized() {
            return Err(GuardError::NotInitialized {
                component: "EncryptionService",
            });
        }
        self.baseline_identity
            .get_or_init(|| async {
                match self.device_info.device_identity().await {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        warn!(error = %e, "AntiTamperMonitor: device info unavailable, drift check disabled");
                        None
                    },
                }
            })
            .await;

        match self.app_identity.app_identity().await {
            Ok(identity) => {
                if self.load_baseline().await?.is_none() {
                    self.store_baseline(&identity).await?;
                }
            },
            Err(e) => warn!(error = %e, "AntiTamperMonitor: app identity unavailable at startup"),
        }

        info!(probe = self.probe.name(), "AntiTamperMonitor: initialized");
        Ok(())
    }

    /// Whether `initialize()` has completed.
    pub fn is_initialized(&self) -> bool {
        self.baseline_identity.initialized()
    }

    /// Stored integrity baseline.
    pub async fn integrity_baseline(&self) -> Result<Option<IntegrityBaseline>, GuardError> {
        self.load_baseline().await
    }

    /// Run every check once.
    pub async fn perform_security_checks(&self) -> Result<SecurityCheckReport, GuardError> {
        let Some(baseline_identity) = self.baseline_identity.get() else {
            return Err(GuardError::NotInitialized {
                component: "AntiTamperMonitor",
            });
        };

        let mut results = Vec::with_capacity(SecurityCheck::ALL.len());
        for check in SecurityCheck::ALL {
            let outcome = match self.run_check(check, baseline_identity.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(check = %check, error = %e, "AntiTamperMonitor: check could not run");
                    CheckOutcome::skipped(e.to_string())
                },
            };
            results.push(CheckResult { check, outcome });
        }

        let report = SecurityCheckReport {
            checked_at: self.clock.now(),
            results,
        };
        if report.passed() {
            debug!("AntiTamperMonitor: all checks passed");
        } else {
            let failed: Vec<&str> = report.failed_checks().iter().map(|c| c.as_str()).collect();
            warn!(failed = ?failed, "AntiTamperMonitor: security checks failed");
        }
        Ok(report)
    }

    async fn run_check(
        &self,
        check: SecurityCheck,
        baseline_identity: Option<&DeviceIdentity>,
    ) -> Result<CheckOutcome, GuardError> {
        match check {
            SecurityCheck::AppIntegrity => self.check_app_integrity().await,
            SecurityCheck::Root => Ok(detected(self.probe.is_rooted().await?, "rooted device")),
            SecurityCheck::Debugger => Ok(detected(
                self.probe.is_debugger_attached().await?,
                "debugger attached",
            )),
            SecurityCheck::ClockSkew => self.check_clock_skew().await,
            SecurityCheck::Emulator => Ok(detected(self.probe.is_emulator().await?, "emulator")),
            SecurityCheck::DeviceDrift => self.check_device_drift(baseline_identity).await,
        }
    }

    async fn check_app_integrity(&self) -> Result<CheckOutcome, GuardError> {
        let current = self.app_identity.app_identity().await?;

        if let Some(expected) = &self.expected_signature {
            if !expected.eq_ignore_ascii_case(&current.signature_hash) {
                return Ok(CheckOutcome::failed("unexpected signature"));
            }
        }
        if current.package_id != self.expected_package {
            return Ok(CheckOutcome::failed("unexpected package"));
        }

        match self.load_baseline().await? {
            None => {
                self.store_baseline(&current).await?;
                Ok(CheckOutcome::Passed)
            },
            Some(baseline) => Ok(match baseline.mismatch(&current) {
                Some(reason) => CheckOutcome::failed(reason),
                None => CheckOutcome::Passed,
            }),
        }
    }

    async fn check_clock_skew(&self) -> Result<CheckOutcome, GuardError> {
        let Some(source) = &self.time_source else {
            return Ok(CheckOutcome::skipped("no trusted time source"));
        };
        let trusted = source.trusted_now().await?;
        let skew = (self.clock.now() - trusted).abs();
        if skew > self.max_skew {
            Ok(CheckOutcome::failed(format!("clock off by {}s", skew.num_seconds())))
        } else {
            Ok(CheckOutcome::Passed)
        }
    }

    async fn check_device_drift(&self, baseline: Option<&DeviceIdentity>) -> Result<CheckOutcome, GuardError> {
        let Some(baseline) = baseline else {
            return Ok(CheckOutcome::skipped("no device baseline"));
        };
        let current = self.device_info.device_identity().await?;
        if current.stable_fields_match(baseline) {
            Ok(CheckOutcome::Passed)
        } else {
            Ok(CheckOutcome::failed("device identity changed"))
        }
    }

    async fn load_baseline(&self) -> Result<Option<IntegrityBaseline>, GuardError> {
        self.encryption.secure_retrieve(INTEGRITY_INFO_KEY).await
    }

    async fn store_baseline(&self, identity: &AppIdentity) -> Result<(), GuardError> {
        let baseline = IntegrityBaseline::capture(identity, self.clock.now());
        self.encryption.secure_store(INTEGRITY_INFO_KEY, &baseline).await?;
        info!(package = %baseline.package_id, version = %baseline.version, "AntiTamperMonitor: integrity baseline recorded");
        Ok(())
    }

    /// Run the checks every interval, sending a violation on failure.
    ///
    /// Calling `start` while already running does nothing.
    pub fn start(self: &Arc<Self>, sink: ViolationSender) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            debug!("AntiTamperMonitor: already running");
            return;
        }

        let monitor: Weak<Self> = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn("anti_tamper", self.interval, move || {
            let monitor = monitor.clone();
            let sink = sink.clone();
            async move {
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                match monitor.perform_security_checks().await {
                    Ok(report) => {
                        if let Some(violation) = report.violation() {
                            if sink.send(violation).is_err() {
                                warn!("AntiTamperMonitor: violation receiver gone");
                            }
                        }
                    },
                    Err(e) => warn!(error = %e, "AntiTamperMonitor: periodic check failed"),
                }
            }
        }));
        info!(interval_secs = self.interval.as_secs(), "AntiTamperMonitor: monitoring started");
    }

    /// Stop the periodic checks.
    pub fn stop_service(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.stop();
            info!("AntiTamperMonitor: monitoring stopped");
        }
    }

    /// Whether the periodic checks are running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, PeriodicTask::is_running)
    }
}

fn detected(found: bool, reason: &str) -> CheckOutcome {
    if found {
        CheckOutcome::failed(reason)
    } else {
        CheckOutcome::Passed
    }
}
