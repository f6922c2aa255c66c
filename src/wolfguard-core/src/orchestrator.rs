//! Security orchestrator.
//!
//! Owns the five services through an explicit [`SecurityContext`], gates
//! startup on an aggregate check and turns violations into a notice plus a
//! delayed termination.
//!
//! ## Startup
//!
//! ```text
//! Encryption ─► TwoFactor ─► AntiTamper ─► License ─► Intrusion
//!                                                         │
//!                  aggregate check (tamper AND license) ◄─┘
//!                        │ pass                 │ fail
//!                        ▼                      ▼
//!         timers + lifecycle listener    violation handler
//! ```
//!
//! ## Violations
//!
//! Background monitors send [`Violation`]s on a channel. The orchestrator
//! logs a `security_failure` activity, notifies the host and asks the
//! [`ShutdownWatchdog`] to terminate after the configured delay.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GuardConfig;
use crate::encryption::EncryptionService;
use crate::error::GuardError;
use crate::host::{
    AppIdentityProvider, Clock, DeviceInfoProvider, EnvironmentProbe, LoggingNotifier,
    NetworkStatusProvider, ProcessExit, StaticNetwork, SystemClock, TerminationHandler,
    TrustedTimeSource, ViolationNotifier,
};
use crate::https::{HttpsLicenseClient, LicenseTransport};
use crate::intrusion::{IntrusionDetector, ResponseAction, ResponsePolicy};
use crate::license::{LicenseVerdict, LicenseVerifier};
use crate::security::{AntiTamperMonitor, PassiveProbe, SecurityCheckReport};
use crate::two_factor::{Enrollment, TwoFactorAuthenticator};
use crate::types::{
    ActivityEntry, AppState, SuspiciousActivity, Violation, ViolationReceiver, ViolationSender,
};
use crate::watchdog::ShutdownWatchdog;
use wolfguard_keyring::KeyValueStore;

/// Activity kind logged when a violation is handled.
pub const SECURITY_FAILURE: &str = "security_failure";
/// Activity kind logged when the app goes to the background.
pub const APP_BACKGROUND: &str = "app_background";
/// Activity kind logged when the app returns to the foreground.
pub const APP_FOREGROUND: &str = "app_foreground";

const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Host wiring
// =============================================================================

/// Everything the host plugs in.
///
/// Only storage, device info and app identity are mandatory; the rest
/// default to the system clock, an always-online network flag, the passive
/// probe, log-only notices, process exit and the HTTPS license client.
pub struct HostCapabilities {
    /// Persistent storage.
    pub store: Arc<dyn KeyValueStore>,
    /// Device identity.
    pub device_info: Arc<dyn DeviceInfoProvider>,
    /// Application identity.
    pub app_identity: Arc<dyn AppIdentityProvider>,
    /// Connectivity.
    pub network: Arc<dyn NetworkStatusProvider>,
    /// Local clock.
    pub clock: Arc<dyn Clock>,
    /// Trusted time, enabling the clock-skew check.
    pub time_source: Option<Arc<dyn TrustedTimeSource>>,
    /// Environment probe.
    pub probe: Arc<dyn EnvironmentProbe>,
    /// User-facing notices.
    pub notifier: Arc<dyn ViolationNotifier>,
    /// App termination.
    pub terminator: Arc<dyn TerminationHandler>,
    /// License transport; `None` builds an [`HttpsLicenseClient`] from config.
    pub transport: Option<Arc<dyn LicenseTransport>>,
}

impl HostCapabilities {
    /// Capabilities with defaults for everything optional.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        device_info: Arc<dyn DeviceInfoProvider>,
        app_identity: Arc<dyn AppIdentityProvider>,
    ) -> Self {
        Self {
            store,
            device_info,
            app_identity,
            network: Arc::new(StaticNetwork::new(true)),
            clock: Arc::new(SystemClock),
            time_source: None,
            probe: Arc::new(PassiveProbe::new()),
            notifier: Arc::new(LoggingNotifier),
            terminator: Arc::new(ProcessExit),
            transport: None,
        }
    }

    /// Use `network` for connectivity.
    pub fn with_network(mut self, network: Arc<dyn NetworkStatusProvider>) -> Self {
        self.network = network;
        self
    }

    /// Use `clock` as local time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable the clock-skew check.
    pub fn with_time_source(mut self, source: Arc<dyn TrustedTimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Use `probe` for root/debugger/emulator detection.
    pub fn with_probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use `notifier` for user-facing notices.
    pub fn with_notifier(mut self, notifier: Arc<dyn ViolationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use `terminator` to end the app.
    pub fn with_terminator(mut self, terminator: Arc<dyn TerminationHandler>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Use `transport` for license requests.
    pub fn with_transport(mut self, transport: Arc<dyn LicenseTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// The five services, wired to one storage and one encryption service.
pub struct SecurityContext {
    /// Configuration the services were built with.
    pub config: GuardConfig,
    /// Device-bound encryption.
    pub encryption: Arc<EncryptionService>,
    /// TOTP and recovery codes.
    pub two_factor: Arc<TwoFactorAuthenticator>,
    /// Runtime integrity checks.
    pub anti_tamper: Arc<AntiTamperMonitor>,
    /// License verification.
    pub license: Arc<LicenseVerifier>,
    /// Abuse detection and activity logs.
    pub intrusion: Arc<IntrusionDetector>,
}

impl SecurityContext {
    /// Build every service. Nothing is initialized yet.
    pub fn new(config: GuardConfig, host: &HostCapabilities) -> Result<Self, GuardError> {
        let transport: Arc<dyn LicenseTransport> = match &host.transport {
            Some(t) => t.clone(),
            None => Arc::new(HttpsLicenseClient::new(&config.license_endpoint, config.request_timeout)?),
        };

        let encryption = Arc::new(EncryptionService::new(
            host.store.clone(),
            host.device_info.clone(),
            &config,
        ));
        let intrusion = Arc::new(IntrusionDetector::new(encryption.clone(), host.clock.clone(), &config));
        let activity = intrusion.shared_activity_log();
        let two_factor = Arc::new(
            TwoFactorAuthenticator::new(encryption.clone(), host.clock.clone(), &config)
                .with_activity_log(activity.clone()),
        );
        let mut monitor = AntiTamperMonitor::new(
            encryption.clone(),
            host.device_info.clone(),
            host.app_identity.clone(),
            host.probe.clone(),
            host.clock.clone(),
            &config,
        );
        if let Some(source) = &host.time_source {
            monitor = monitor.with_time_source(source.clone());
        }
        let license = Arc::new(
            LicenseVerifier::new(
                encryption.clone(),
                transport,
                host.network.clone(),
                host.device_info.clone(),
                host.clock.clone(),
                &config,
            )
            .with_activity_log(activity),
        );

        Ok(Self {
            config,
            encryption,
            two_factor,
            anti_tamper: Arc::new(monitor),
            license,
            intrusion,
        })
    }

    async fn initialize_all(&self) -> Result<(), GuardError> {
        self.encryption.initialize().await?;
        info!("SecurityContext: encryption ready");
        self.two_factor.initialize().await?;
        info!("SecurityContext: two-factor ready");
        self.anti_tamper.initialize().await?;
        info!("SecurityContext: anti-tamper ready");
        self.license.initialize().await?;
        info!("SecurityContext: license verifier ready");
        self.intrusion.initialize().await?;
        info!("SecurityContext: intrusion detection ready");
        Ok(())
    }
}

// =============================================================================
// Aggregate status
// =============================================================================

/// Result of [`SecurityOrchestrator::perform_security_check`].
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    /// Anti-tamper report.
    pub tamper: SecurityCheckReport,
    /// License verdict; `None` when no license key is stored.
    pub license: Option<LicenseVerdict>,
}

impl SecurityStatus {
    /// Anti-tamper passed and, if a license is stored, it is valid.
    pub fn passed(&self) -> bool {
        self.tamper.passed() && self.license.as_ref().map_or(true, |v| v.is_valid)
    }

    /// The violation to raise, tamper first.
    pub fn violation(&self) -> Option<Violation> {
        if let Some(v) = self.tamper.violation() {
            return Some(v);
        }
        match &self.license {
            Some(verdict) if !verdict.is_valid => Some(Violation::License {
                reason: verdict.message.clone(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates startup, periodic monitoring and violation handling.
pub struct SecurityOrchestrator {
    context: SecurityContext,
    notifier: Arc<dyn ViolationNotifier>,
    watchdog: ShutdownWatchdog,
    startup: OnceCell<SecurityStatus>,
    violation_tx: ViolationSender,
    violation_rx: Arc<tokio::sync::Mutex<ViolationReceiver>>,
    lifecycle_tx: mpsc::Sender<AppState>,
    lifecycle_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AppState>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityOrchestrator {
    /// Validate `config` and build every service.
    pub fn new(config: GuardConfig, host: HostCapabilities) -> Result<Arc<Self>, GuardError> {
        config.validate()?;
        let watchdog = ShutdownWatchdog::new(host.terminator.clone(), config.termination_delay);
        let notifier = host.notifier.clone();
        let context = SecurityContext::new(config, &host)?;

        let (violation_tx, violation_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            context,
            notifier,
            watchdog,
            startup: OnceCell::new(),
            violation_tx,
            violation_rx: Arc::new(tokio::sync::Mutex::new(violation_rx)),
            lifecycle_tx,
            lifecycle_rx: Arc::new(tokio::sync::Mutex::new(lifecycle_rx)),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    /// The wired services.
    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    /// The termination watchdog.
    pub fn watchdog(&self) -> &ShutdownWatchdog {
        &self.watchdog
    }

    /// Channel the host sends foreground/background transitions on.
    pub fn lifecycle_sender(&self) -> mpsc::Sender<AppState> {
        self.lifecycle_tx.clone()
    }

    /// Channel for reporting violations from outside the built-in monitors.
    pub fn violation_sender(&self) -> ViolationSender {
        self.violation_tx.clone()
    }

    /// Whether startup completed.
    pub fn is_initialized(&self) -> bool {
        self.startup.initialized()
    }

    /// Initialize every service in order, run the startup check and start
    /// monitoring.
    ///
    /// Returns the startup status; later calls return the same status. If
    /// the startup check fails the violation handler runs and monitoring is
    /// not started. If a service fails to initialize, encryption is still
    /// brought up so stored data stays readable, and the error is returned.
    pub async fn initialize(self: &Arc<Self>) -> Result<SecurityStatus, GuardError> {
        let status = self
            .startup
            .get_or_try_init(|| async {
                info!("SecurityOrchestrator: initializing security services");
                if let Err(e) = self.context.initialize_all().await {
                    error!(error = %e, "SecurityOrchestrator: initialization failed, encryption-only mode");
                    if let Err(enc) = self.context.encryption.initialize().await {
                        error!(error = %enc, "SecurityOrchestrator: encryption unavailable");
                    }
                    return Err(e);
                }

                let status = self.perform_security_check().await?;
                match status.violation() {
                    Some(violation) => {
                        error!(violation = ?violation, "SecurityOrchestrator: startup check failed");
                        self.handle_violation(violation).await;
                    },
                    None => {
                        self.start_services();
                        info!("SecurityOrchestrator: all security services running");
                    },
                }
                Ok(status)
            })
            .await?;
        Ok(status.clone())
    }

    /// Anti-tamper checks AND, when a license key is stored, license
    /// verification.
    pub async fn perform_security_check(&self) -> Result<SecurityStatus, GuardError> {
        let tamper = self.context.anti_tamper.perform_security_checks().await?;
        let license = match self.context.license.stored_license_key().await {
            Some(key) => Some(self.context.license.verify_license(&key, false).await?),
            None => None,
        };
        let status = SecurityStatus { tamper, license };
        if status.passed() {
            info!("SecurityOrchestrator: security check passed");
        } else {
            warn!("SecurityOrchestrator: security check failed");
        }
        Ok(status)
    }

    /// Log a violation, notify the host and schedule termination.
    pub async fn handle_violation(&self, violation: Violation) {
        error!(violation = ?violation, "SecurityOrchestrator: security violation, taking action");
        self.context
            .intrusion
            .log_activity(SECURITY_FAILURE, json!({ "violation": violation }))
            .await;
        self.notifier.notify(&violation).await;
        self.watchdog.request_termination(&violation.describe());
    }

    /// React to a foreground/background transition.
    ///
    /// Returning to the foreground re-runs the aggregate check and returns
    /// its status.
    pub async fn handle_app_state_change(&self, state: AppState) -> Result<Option<SecurityStatus>, GuardError> {
        match state {
            AppState::Background => {
                self.context.intrusion.log_activity(APP_BACKGROUND, json!({})).await;
                Ok(None)
            },
            AppState::Foreground => {
                self.context.intrusion.log_activity(APP_FOREGROUND, json!({})).await;
                let status = self.perform_security_check().await?;
                if let Some(violation) = status.violation() {
                    self.handle_violation(violation).await;
                }
                Ok(Some(status))
            },
        }
    }

    /// Start the periodic monitors and the channel listeners.
    ///
    /// Called by `initialize()` after a passing startup check; only needed
    /// directly to resume after [`stop_services`](Self::stop_services).
    pub fn start_services(self: &Arc<Self>) {
        self.context.anti_tamper.start(self.violation_tx.clone());
        self.context.license.start(self.violation_tx.clone());

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.is_empty() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let rx = self.violation_rx.clone();
        listeners.push(tokio::spawn(async move {
            let mut rx = rx.lock().await;
            while let Some(violation) = rx.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_violation(violation).await;
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let rx = self.lifecycle_rx.clone();
        listeners.push(tokio::spawn(async move {
            let mut rx = rx.lock().await;
            while let Some(state) = rx.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = this.handle_app_state_change(state).await {
                    warn!(error = %e, state = ?state, "SecurityOrchestrator: lifecycle check failed");
                }
            }
        }));
    }

    /// Stop every timer and listener.
    pub fn stop_services(&self) {
        self.context.anti_tamper.stop_service();
        self.context.license.stop_service();
        for handle in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        info!("SecurityOrchestrator: security services stopped");
    }

    /// Whether the periodic monitors are running.
    pub fn is_monitoring(&self) -> bool {
        self.context.anti_tamper.is_running() || self.context.license.is_running()
    }

    // =========================================================================
    // Facade
    // =========================================================================

    /// See [`EncryptionService::encrypt`].
    pub fn encrypt(&self, data: &str, salt: Option<&str>) -> Result<String, GuardError> {
        self.context.encryption.encrypt(data, salt)
    }

    /// See [`EncryptionService::decrypt`].
    pub fn decrypt(&self, ciphertext: &str, salt: Option<&str>) -> Result<String, GuardError> {
        self.context.encryption.decrypt(ciphertext, salt)
    }

    /// See [`EncryptionService::encrypt_sensitive`].
    pub fn encrypt_sensitive(&self, data: &str, user_key: &str) -> Result<String, GuardError> {
        self.context.encryption.encrypt_sensitive(data, user_key)
    }

    /// See [`EncryptionService::decrypt_sensitive`].
    pub fn decrypt_sensitive(&self, ciphertext: &str, user_key: &str) -> Result<String, GuardError> {
        self.context.encryption.decrypt_sensitive(ciphertext, user_key)
    }

    /// See [`TwoFactorAuthenticator::enable_2fa`].
    pub async fn enable_2fa(&self, user_id: &str) -> Result<Enrollment, GuardError> {
        self.context.two_factor.enable_2fa(user_id).await
    }

    /// See [`TwoFactorAuthenticator::is_2fa_enabled`].
    pub async fn is_2fa_enabled(&self, user_id: &str) -> Result<bool, GuardError> {
        self.context.two_factor.is_2fa_enabled(user_id).await
    }

    /// See [`TwoFactorAuthenticator::disable_2fa`].
    pub async fn disable_2fa(&self, user_id: &str) -> Result<(), GuardError> {
        self.context.two_factor.disable_2fa(user_id).await
    }

    /// See [`TwoFactorAuthenticator::verify_totp`].
    pub async fn verify_totp(&self, user_id: &str, code: &str) -> Result<bool, GuardError> {
        self.context.two_factor.verify_totp(user_id, code).await
    }

    /// See [`TwoFactorAuthenticator::verify_recovery_code`].
    pub async fn verify_recovery_code(&self, user_id: &str, code: &str) -> Result<bool, GuardError> {
        self.context.two_factor.verify_recovery_code(user_id, code).await
    }

    /// See [`TwoFactorAuthenticator::generate_recovery_codes`].
    pub async fn generate_recovery_codes(&self, user_id: &str, count: Option<usize>) -> Result<Vec<String>, GuardError> {
        self.context.two_factor.generate_recovery_codes(user_id, count).await
    }

    /// See [`TwoFactorAuthenticator::remaining_recovery_codes`].
    pub async fn remaining_recovery_codes(&self, user_id: &str) -> Result<usize, GuardError> {
        self.context.two_factor.remaining_recovery_codes(user_id).await
    }

    /// See [`LicenseVerifier::verify_license`].
    pub async fn verify_license(&self, license_key: &str, force_online: bool) -> Result<LicenseVerdict, GuardError> {
        self.context.license.verify_license(license_key, force_online).await
    }

    /// See [`IntrusionDetector::record_login_attempt`].
    pub async fn record_login_attempt(&self, user_id: &str, success: bool, details: Value) -> bool {
        self.context.intrusion.record_login_attempt(user_id, success, details).await
    }

    /// See [`IntrusionDetector::reset_login_attempts`].
    pub async fn reset_login_attempts(&self, user_id: &str) {
        self.context.intrusion.reset_login_attempts(user_id).await;
    }

    /// See [`IntrusionDetector::detect_injection_attack`].
    pub async fn detect_injection_attack(&self, input: &str) -> bool {
        self.context.intrusion.detect_injection_attack(input).await
    }

    /// See [`IntrusionDetector::detect_brute_force_attack`].
    pub async fn detect_brute_force_attack(&self, request_count: u64, time_window_ms: u64, endpoint: &str) -> bool {
        self.context
            .intrusion
            .detect_brute_force_attack(request_count, time_window_ms, endpoint)
            .await
    }

    /// See [`IntrusionDetector::log_activity`].
    pub async fn log_activity(&self, kind: &str, details: Value) {
        self.context.intrusion.log_activity(kind, details).await;
    }

    /// See [`IntrusionDetector::record_suspicious_activity`].
    pub async fn record_suspicious_activity(&self, kind: &str, details: Value) -> ResponseAction {
        self.context.intrusion.record_suspicious_activity(kind, details).await
    }

    /// See [`IntrusionDetector::activity_log`].
    pub async fn activity_log(&self) -> Vec<ActivityEntry> {
        self.context.intrusion.activity_log().await
    }

    /// See [`IntrusionDetector::suspicious_activities`].
    pub async fn suspicious_activities(&self) -> Vec<SuspiciousActivity> {
        self.context.intrusion.suspicious_activities().await
    }

    /// See [`IntrusionDetector::clear_suspicious_activities`].
    pub async fn clear_suspicious_activities(&self) {
        self.context.intrusion.clear_suspicious_activities().await;
    }

    /// Replace the intrusion response policy.
    pub async fn set_response_policy(&self, policy: Arc<dyn ResponsePolicy>) {
        self.context.intrusion.set_response_policy(policy).await;
    }
}

impl Drop for SecurityOrchestrator {
    fn drop(&mut self) {
        for handle in self
            .listeners
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}
