//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wolfguard_core::{
    AppIdentity, Clock, DeviceIdentity, DeviceInfoProvider, EncryptionService, EnvironmentProbe,
    GuardConfig, GuardError, LicenseRequest, LicenseResponse, LicenseTransport, ManualClock,
    TerminationHandler, TrustedTimeSource, Violation, ViolationNotifier,
};
use wolfguard_keyring::MemoryStore;

pub fn device(uuid: &str) -> DeviceIdentity {
    DeviceIdentity {
        uuid: uuid.to_string(),
        platform: "android".into(),
        model: "Pixel 8".into(),
        os_version: "14".into(),
        app_version: "2.1.0".into(),
        build_number: "210".into(),
    }
}

pub fn app(signature: &str) -> AppIdentity {
    AppIdentity {
        signature_hash: signature.to_string(),
        package_id: "com.wolf.app".into(),
        version: "2.1.0 (210)".into(),
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Initialized encryption service over a fresh or shared store.
pub async fn encryption(
    store: Arc<MemoryStore>,
    device_info: Arc<dyn DeviceInfoProvider>,
) -> Arc<EncryptionService> {
    let svc = EncryptionService::new(store, device_info, &GuardConfig::default());
    svc.initialize().await.unwrap();
    Arc::new(svc)
}

/// Device info the test can swap mid-session.
pub struct SwappableDevice {
    current: Mutex<DeviceIdentity>,
}

impl SwappableDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            current: Mutex::new(identity),
        }
    }

    pub fn swap(&self, identity: DeviceIdentity) {
        *self.current.lock().unwrap() = identity;
    }
}

#[async_trait]
impl DeviceInfoProvider for SwappableDevice {
    async fn device_identity(&self) -> Result<DeviceIdentity, GuardError> {
        Ok(self.current.lock().unwrap().clone())
    }
}

/// License backend answering from a script; an empty script means "offline".
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<LicenseResponse, String>>>,
    pub requests: Mutex<Vec<LicenseRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, response: LicenseResponse) -> &Self {
        self.script.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn fail(&self, message: &str) -> &Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LicenseTransport for MockTransport {
    async fn verify(&self, request: &LicenseRequest) -> Result<LicenseResponse, GuardError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(GuardError::network(message)),
            None => Err(GuardError::network("no scripted response")),
        }
    }
}

pub fn valid_response(expiry: &str) -> LicenseResponse {
    LicenseResponse {
        is_valid: true,
        license_info: serde_json::json!({ "expiryDate": expiry, "plan": "pro" })
            .as_object()
            .cloned(),
        message: None,
    }
}

/// Termination handler that records instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    pub reasons: Mutex<Vec<String>>,
}

impl RecordingTerminator {
    pub fn count(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }
}

impl TerminationHandler for RecordingTerminator {
    fn terminate(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// Notifier that records every violation.
#[derive(Default)]
pub struct RecordingNotifier {
    pub violations: Mutex<Vec<Violation>>,
}

impl RecordingNotifier {
    pub fn seen(&self) -> Vec<Violation> {
        self.violations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ViolationNotifier for RecordingNotifier {
    async fn notify(&self, violation: &Violation) {
        self.violations.lock().unwrap().push(violation.clone());
    }
}

/// Probe whose answers the test controls.
#[derive(Default)]
pub struct ScriptedProbe {
    pub rooted: AtomicBool,
    pub debugger: AtomicBool,
    pub emulator: AtomicBool,
    pub broken: AtomicBool,
}

impl ScriptedProbe {
    fn answer(&self, flag: &AtomicBool) -> Result<bool, GuardError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(GuardError::host("probe", "sensor offline"));
        }
        Ok(flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl EnvironmentProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn is_rooted(&self) -> Result<bool, GuardError> {
        self.answer(&self.rooted)
    }

    async fn is_debugger_attached(&self) -> Result<bool, GuardError> {
        self.answer(&self.debugger)
    }

    async fn is_emulator(&self) -> Result<bool, GuardError> {
        self.answer(&self.emulator)
    }
}

/// Trusted time at a fixed offset from a clock.
pub struct OffsetTimeSource {
    pub clock: Arc<ManualClock>,
    pub offset: chrono::Duration,
}

#[async_trait]
impl TrustedTimeSource for OffsetTimeSource {
    async fn trusted_now(&self) -> Result<DateTime<Utc>, GuardError> {
        Ok(self.clock.now() + self.offset)
    }
}
