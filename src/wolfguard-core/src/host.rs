//! Host capability traits.
//!
//! The trust layer never talks to the platform directly. Everything it needs
//! from the surrounding application (device info, connectivity, time, the
//! ability to alert the user or terminate) comes in through these traits,
//! injected once at construction.
//!
//! ```text
//!   host app ──► DeviceInfoProvider / NetworkStatusProvider / Clock
//!            ──► TrustedTimeSource / EnvironmentProbe / AppIdentityProvider
//!   core     ──► ViolationNotifier / TerminationHandler ──► host app
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::GuardError;
use crate::types::{AppIdentity, DeviceIdentity, Violation};

/// Supplies the identity of the device.
#[async_trait]
pub trait DeviceInfoProvider: Send + Sync {
    /// Collect the current device identity.
    async fn device_identity(&self) -> Result<DeviceIdentity, GuardError>;
}

/// Reports network connectivity.
#[async_trait]
pub trait NetworkStatusProvider: Send + Sync {
    /// Whether the device currently has a network connection.
    async fn is_connected(&self) -> bool;
}

/// Time from a source the user cannot tamper with (e.g. an NTP or HTTPS date).
#[async_trait]
pub trait TrustedTimeSource: Send + Sync {
    /// Current trusted time.
    async fn trusted_now(&self) -> Result<DateTime<Utc>, GuardError>;
}

/// Local wall clock.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> DateTime<Utc>;
}

/// Platform-specific compromise heuristics.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Probe name for logs.
    fn name(&self) -> &'static str;

    /// Rooted or jailbroken device.
    async fn is_rooted(&self) -> Result<bool, GuardError>;

    /// Debugger attached to the process.
    async fn is_debugger_attached(&self) -> Result<bool, GuardError>;

    /// Running inside an emulator or simulator.
    async fn is_emulator(&self) -> Result<bool, GuardError>;
}

/// Supplies what the running application claims to be.
#[async_trait]
pub trait AppIdentityProvider: Send + Sync {
    /// Current app identity.
    async fn app_identity(&self) -> Result<AppIdentity, GuardError>;
}

/// Surfaces a violation to the user.
#[async_trait]
pub trait ViolationNotifier: Send + Sync {
    /// Show a human-facing notice for `violation`.
    async fn notify(&self, violation: &Violation);
}

/// Ends the application.
pub trait TerminationHandler: Send + Sync {
    /// Terminate. Called at most once per process.
    fn terminate(&self, reason: &str);
}

// =============================================================================
// Default implementations
// =============================================================================

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    /// Move forward (or backward, for negative durations).
    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// Device info fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo {
    identity: DeviceIdentity,
}

impl StaticDeviceInfo {
    /// Always report `identity`.
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl DeviceInfoProvider for StaticDeviceInfo {
    async fn device_identity(&self) -> Result<DeviceIdentity, GuardError> {
        Ok(self.identity.clone())
    }
}

/// Device info provider that always fails, forcing the fallback key.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDeviceInfo;

#[async_trait]
impl DeviceInfoProvider for UnavailableDeviceInfo {
    async fn device_identity(&self) -> Result<DeviceIdentity, GuardError> {
        Err(GuardError::host("device_info", "device info unavailable"))
    }
}

/// Connectivity flag the host flips.
#[derive(Debug)]
pub struct StaticNetwork {
    connected: AtomicBool,
}

impl StaticNetwork {
    /// Create with an initial state.
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    /// Update connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkStatusProvider for StaticNetwork {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// App identity fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticAppIdentity {
    identity: AppIdentity,
}

impl StaticAppIdentity {
    /// Always report `identity`.
    pub fn new(identity: AppIdentity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl AppIdentityProvider for StaticAppIdentity {
    async fn app_identity(&self) -> Result<AppIdentity, GuardError> {
        Ok(self.identity.clone())
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl ViolationNotifier for LoggingNotifier {
    async fn notify(&self, violation: &Violation) {
        error!(violation = ?violation, "{}", violation.describe());
    }
}

/// Terminates the current process with a non-zero exit code.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

/// Exit code used by [`ProcessExit`].
pub const VIOLATION_EXIT_CODE: i32 = 3;

impl TerminationHandler for ProcessExit {
    fn terminate(&self, reason: &str) {
        error!(reason = %reason, "Terminating after security violation");
        std::process::exit(VIOLATION_EXIT_CODE);
    }
}
