//! # wolfguard-core
//!
//! Client-side trust and access layer: device-bound encryption, TOTP
//! two-factor authentication, intrusion detection, runtime anti-tamper
//! monitoring and license gating with an offline grace period.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SecurityOrchestrator                        │
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────┐      │
//! │  │              EncryptionService                    │      │
//! │  │   (PBKDF2 device key, AES-256-CBC, secure_*)      │      │
//! │  └──────────────────────────────────────────────────┘      │
//! │        │              │              │             │         │
//! │        ▼              ▼              ▼             ▼         │
//! │  ┌───────────┐ ┌─────────────┐ ┌───────────┐ ┌───────────┐ │
//! │  │ TwoFactor │ │ AntiTamper  │ │  License  │ │ Intrusion │ │
//! │  │  (TOTP)   │ │  (60 s)     │ │  (24 h)   │ │ (logs)    │ │
//! │  └───────────┘ └─────────────┘ └───────────┘ └───────────┘ │
//! │                       │              │                       │
//! │                       └── Violation ─┘                       │
//! │                              │                               │
//! │                              ▼                               │
//! │            notifier + ShutdownWatchdog (2 s)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Device-bound**: keys derive from the device fingerprint and are never persisted
//! - **Encrypted at rest**: every persisted value goes through `secure_store`
//! - **Fail-open sensors**: a probe that errors never locks users out
//! - **No override**: once termination is issued it cannot be cancelled
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wolfguard_core::{GuardConfig, HostCapabilities, SecurityOrchestrator};
//!
//! let host = HostCapabilities::new(store, device_info, app_identity);
//! let guard = SecurityOrchestrator::new(GuardConfig::default(), host)?;
//! let status = guard.initialize().await?;
//! assert!(status.passed());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod audit;
pub mod cache;
pub mod config;
pub mod encryption;
pub mod error;
pub mod host;
pub mod https;
pub mod intrusion;
pub mod license;
pub mod orchestrator;
pub mod schedule;
pub mod security;
pub mod two_factor;
pub mod types;
pub mod watchdog;

pub use audit::{ActivityLog, ACTIVITY_LOG_KEY, SUSPICIOUS_ACTIVITIES_KEY};
pub use cache::{LicenseCache, OfflineCheck, LICENSE_INFO_KEY};
pub use config::GuardConfig;
pub use encryption::EncryptionService;
pub use error::GuardError;
pub use host::{
    AppIdentityProvider, Clock, DeviceInfoProvider, EnvironmentProbe, LoggingNotifier,
    ManualClock, NetworkStatusProvider, ProcessExit, StaticAppIdentity, StaticDeviceInfo,
    StaticNetwork, SystemClock, TerminationHandler, TrustedTimeSource, UnavailableDeviceInfo,
    ViolationNotifier,
};
pub use https::{HttpsLicenseClient, LicenseTransport};
pub use intrusion::{
    InjectionCategory, IntrusionDetector, LoggingResponsePolicy, ResponseAction, ResponsePolicy,
};
pub use license::{
    DeviceInfoPayload, LicenseRecord, LicenseRequest, LicenseResponse, LicenseState,
    LicenseVerdict, LicenseVerifier, VerdictSource,
};
pub use orchestrator::{HostCapabilities, SecurityContext, SecurityOrchestrator, SecurityStatus};
pub use schedule::PeriodicTask;
pub use security::{
    AntiTamperMonitor, CheckOutcome, ExecutableIdentity, HostDeviceInfo, IntegrityBaseline,
    PassiveProbe, ProcStatusProbe, SecurityCheck, SecurityCheckReport,
};
pub use two_factor::{Enrollment, TotpSecret, TwoFactorAuthenticator};
pub use types::{
    ActivityEntry, AppIdentity, AppState, DeviceIdentity, SuspiciousActivity, Violation,
    ViolationReceiver, ViolationSender,
};
pub use watchdog::ShutdownWatchdog;
