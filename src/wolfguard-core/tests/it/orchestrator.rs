//! End-to-end orchestration: startup, lifecycle, violations and termination.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wolfguard_core::license::{LICENSE_CHECK_FAILED, LICENSE_REJECTED};
use wolfguard_core::orchestrator::{APP_BACKGROUND, APP_FOREGROUND, SECURITY_FAILURE};
use wolfguard_core::two_factor::{RECOVERY_CODE_FAILURE, TOTP_FAILURE};
use wolfguard_core::{
    AppState, Clock, GuardConfig, GuardError, HostCapabilities, ManualClock, SecurityOrchestrator,
    StaticAppIdentity, StaticDeviceInfo, StaticNetwork, Violation,
};
use wolfguard_crypto::{totp_base32, TotpParams};
use wolfguard_keyring::{KeyValueStore, KeyringError, MemoryStore, StorageBackend};

use crate::common::{
    app, device, manual_clock, valid_response, MockTransport, RecordingNotifier, RecordingTerminator,
    ScriptedProbe,
};

const KEY: &str = "WOLF-ORCH-0001";

struct Harness {
    guard: Arc<SecurityOrchestrator>,
    probe: Arc<ScriptedProbe>,
    notifier: Arc<RecordingNotifier>,
    terminator: Arc<RecordingTerminator>,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
}

fn build(store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>, online: bool) -> Harness {
    let probe = Arc::new(ScriptedProbe::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let terminator = Arc::new(RecordingTerminator::default());
    let transport = Arc::new(MockTransport::new());
    let host = HostCapabilities::new(
        store,
        Arc::new(StaticDeviceInfo::new(device("orch-device"))),
        Arc::new(StaticAppIdentity::new(app("sig-orch"))),
    )
    .with_clock(clock.clone())
    .with_network(Arc::new(StaticNetwork::new(online)))
    .with_probe(probe.clone())
    .with_notifier(notifier.clone())
    .with_terminator(terminator.clone())
    .with_transport(transport.clone());

    Harness {
        guard: SecurityOrchestrator::new(GuardConfig::default(), host).unwrap(),
        probe,
        notifier,
        terminator,
        transport,
        clock,
    }
}

fn harness() -> Harness {
    build(Arc::new(MemoryStore::new()), manual_clock(), true)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_clean_startup_starts_monitoring() {
    let h = harness();
    let status = h.guard.initialize().await.unwrap();

    assert!(status.passed());
    assert!(status.license.is_none());
    assert!(h.guard.is_initialized());
    assert!(h.guard.is_monitoring());
    assert!(!h.guard.watchdog().is_issued());

    h.guard.stop_services();
    assert!(!h.guard.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_startup_tamper_failure_terminates_after_delay() {
    let h = harness();
    h.probe.rooted.store(true, Ordering::SeqCst);

    let status = h.guard.initialize().await.unwrap();

    assert!(!status.passed());
    assert!(!h.guard.is_monitoring());
    let expected = Violation::Tamper {
        failed_checks: vec!["root".into()],
    };
    assert_eq!(h.notifier.seen(), vec![expected.clone()]);

    let failures: Vec<_> = h
        .guard
        .context()
        .intrusion
        .activity_log()
        .await
        .into_iter()
        .filter(|e| e.kind == SECURITY_FAILURE)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].details["violation"], json!(expected));

    assert!(h.guard.watchdog().is_issued());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.terminator.count(), 0);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.terminator.count(), 1);
    assert!(h.guard.watchdog().has_fired());
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let h = harness();
    h.guard.initialize().await.unwrap();
    h.probe.debugger.store(true, Ordering::SeqCst);

    let again = h.guard.initialize().await.unwrap();
    assert!(again.passed());
    assert!(h.notifier.seen().is_empty());
    h.guard.stop_services();
}

/// Store that fails every read.
struct UnreadableStore;

#[async_trait]
impl KeyValueStore for UnreadableStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyringError> {
        Err(KeyringError::read(key, "disk unavailable"))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), KeyringError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), KeyringError> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, KeyringError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_component_failure_leaves_encryption_usable() {
    let h = build(Arc::new(UnreadableStore), manual_clock(), true);

    let err = h.guard.initialize().await.unwrap_err();

    assert!(matches!(err, GuardError::Storage(_)));
    assert!(!h.guard.is_initialized());
    assert!(h.guard.context().encryption.is_initialized());
    let sealed = h.guard.encrypt("still works", None).unwrap();
    assert_eq!(h.guard.decrypt(&sealed, None).unwrap(), "still works");
}

#[tokio::test]
async fn test_oversized_grace_period_rejected_at_construction() {
    let config = GuardConfig {
        offline_grace_days: 100_000_000_000,
        ..GuardConfig::default()
    };
    let host = HostCapabilities::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticDeviceInfo::new(device("orch-device"))),
        Arc::new(StaticAppIdentity::new(app("sig-orch"))),
    )
    .with_transport(Arc::new(MockTransport::new()));
    assert!(matches!(
        SecurityOrchestrator::new(config, host),
        Err(GuardError::Config { .. })
    ));
}

// =============================================================================
// License in the aggregate check
// =============================================================================

#[tokio::test]
async fn test_stored_license_is_part_of_the_check() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    {
        let h = build(store.clone(), clock.clone(), true);
        h.guard.initialize().await.unwrap();
        h.transport.respond(valid_response("2030-01-01"));
        assert!(h.guard.verify_license(KEY, false).await.unwrap().is_valid);
        h.guard.stop_services();
    }

    let h = build(store, clock, false);
    let status = h.guard.initialize().await.unwrap();

    assert!(status.passed());
    let verdict = status.license.expect("license verdict");
    assert!(verdict.is_valid);
    assert_eq!(h.transport.request_count(), 0);
    h.guard.stop_services();
}

#[tokio::test]
async fn test_stale_offline_license_fails_startup() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    {
        let h = build(store.clone(), clock.clone(), true);
        h.guard.initialize().await.unwrap();
        h.transport.respond(valid_response("2030-01-01"));
        h.guard.verify_license(KEY, false).await.unwrap();
        h.guard.stop_services();
    }

    clock.advance(chrono::Duration::days(8));
    let h = build(store, clock, false);
    let status = h.guard.initialize().await.unwrap();

    assert!(!status.passed());
    assert!(status.tamper.passed());
    assert!(matches!(
        h.notifier.seen().as_slice(),
        [Violation::License { reason }] if reason.starts_with("Offline grace period exceeded")
    ));
}

// =============================================================================
// Lifecycle and channels
// =============================================================================

#[tokio::test]
async fn test_foreground_rechecks_and_background_logs() {
    let h = harness();
    h.guard.initialize().await.unwrap();

    assert!(h
        .guard
        .handle_app_state_change(AppState::Background)
        .await
        .unwrap()
        .is_none());

    h.probe.debugger.store(true, Ordering::SeqCst);
    let status = h
        .guard
        .handle_app_state_change(AppState::Foreground)
        .await
        .unwrap()
        .expect("foreground runs a check");
    assert!(!status.passed());
    assert_eq!(
        h.notifier.seen(),
        vec![Violation::Tamper {
            failed_checks: vec!["debugger".into()]
        }]
    );

    let kinds: Vec<String> = h
        .guard
        .context()
        .intrusion
        .activity_log()
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![APP_BACKGROUND, APP_FOREGROUND, SECURITY_FAILURE]);
    h.guard.stop_services();
}

#[tokio::test]
async fn test_lifecycle_channel_drives_checks() {
    let h = harness();
    h.guard.initialize().await.unwrap();
    h.probe.emulator.store(true, Ordering::SeqCst);

    h.guard.lifecycle_sender().send(AppState::Foreground).await.unwrap();

    let notifier = h.notifier.clone();
    wait_for(move || !notifier.seen().is_empty()).await;
    assert_eq!(
        h.notifier.seen(),
        vec![Violation::Tamper {
            failed_checks: vec!["emulator".into()]
        }]
    );
    h.guard.stop_services();
}

#[tokio::test]
async fn test_external_violation_is_handled() {
    let h = harness();
    h.guard.initialize().await.unwrap();

    let violation = Violation::License {
        reason: "seat limit reached".into(),
    };
    h.guard.violation_sender().send(violation.clone()).unwrap();

    let notifier = h.notifier.clone();
    wait_for(move || !notifier.seen().is_empty()).await;
    assert_eq!(h.notifier.seen(), vec![violation]);
    assert!(h.guard.watchdog().is_issued());
    h.guard.stop_services();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_violation_terminates_once() {
    let h = harness();
    h.guard.initialize().await.unwrap();
    h.probe.rooted.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.notifier.seen().len(), 1);
    assert_eq!(h.terminator.count(), 0);

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert!(h.notifier.seen().len() >= 2);
    assert_eq!(h.terminator.count(), 1);
    h.guard.stop_services();
}

// =============================================================================
// Facade
// =============================================================================

#[tokio::test]
async fn test_facade_delegates_to_services() {
    let h = harness();
    h.guard.initialize().await.unwrap();

    let sealed = h.guard.encrypt_sensitive("card 4111", "pin-1234").unwrap();
    assert_eq!(h.guard.decrypt_sensitive(&sealed, "pin-1234").unwrap(), "card 4111");

    let enrollment = h.guard.enable_2fa("alice").await.unwrap();
    let code = totp_base32(&enrollment.secret, h.clock.now().timestamp(), &TotpParams::default()).unwrap();
    assert!(h.guard.verify_totp("alice", &code).await.unwrap());

    assert!(h.guard.record_login_attempt("alice", true, json!({})).await);
    assert!(h.guard.detect_injection_attack("<script>steal()</script>").await);
    assert!(!h.guard.detect_brute_force_attack(5, 1000, "/api").await);
    h.guard.stop_services();
}

#[tokio::test]
async fn test_facade_covers_account_and_log_operations() {
    let h = harness();
    h.guard.initialize().await.unwrap();

    h.guard.enable_2fa("bob").await.unwrap();
    assert!(h.guard.is_2fa_enabled("bob").await.unwrap());
    let codes = h.guard.generate_recovery_codes("bob", Some(3)).await.unwrap();
    assert_eq!(codes.len(), 3);
    assert!(h.guard.verify_recovery_code("bob", &codes[0]).await.unwrap());
    assert_eq!(h.guard.remaining_recovery_codes("bob").await.unwrap(), 2);
    h.guard.disable_2fa("bob").await.unwrap();
    assert!(!h.guard.is_2fa_enabled("bob").await.unwrap());

    h.guard.record_login_attempt("bob", false, json!({})).await;
    h.guard.reset_login_attempts("bob").await;
    assert_eq!(h.guard.context().intrusion.login_attempt_count("bob").await, 0);
    assert!(h.guard.activity_log().await.iter().any(|e| e.kind == "login_failure"));

    assert!(h.guard.detect_injection_attack("name;cat /etc/passwd").await);
    assert_eq!(h.guard.suspicious_activities().await.len(), 1);
    h.guard.clear_suspicious_activities().await;
    assert!(h.guard.suspicious_activities().await.is_empty());
    h.guard.stop_services();
}

/// A six-digit code outside the accepted T-1..T+1 window.
fn rejected_code(secret: &str, now: i64) -> String {
    let accepted: Vec<String> = [-30, 0, 30]
        .iter()
        .map(|offset| totp_base32(secret, now + offset, &TotpParams::default()).unwrap())
        .collect();
    (0..1_000_000u32)
        .map(|n| format!("{n:06}"))
        .find(|code| !accepted.contains(code))
        .unwrap()
}

#[tokio::test]
async fn test_failure_paths_write_activity() {
    let h = harness();
    h.guard.initialize().await.unwrap();
    assert!(h.guard.activity_log().await.is_empty());

    h.transport.fail("backend down");
    let verdict = h.guard.verify_license(KEY, true).await.unwrap();
    assert!(!verdict.is_valid);

    let secret = h.guard.enable_2fa("alice").await.unwrap().secret;
    h.guard.generate_recovery_codes("alice", Some(2)).await.unwrap();
    let wrong = rejected_code(&secret, h.clock.now().timestamp());
    assert!(!h.guard.verify_totp("alice", &wrong).await.unwrap());
    assert!(!h.guard.verify_recovery_code("alice", "ZZZZZZZZZZ").await.unwrap());

    let log = h.guard.activity_log().await;
    let kinds: Vec<&str> = log.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec![LICENSE_CHECK_FAILED, LICENSE_REJECTED, TOTP_FAILURE, RECOVERY_CODE_FAILURE]
    );
    assert_eq!(log[0].details["stage"], "online");
    assert_eq!(log[1].details["source"], "offline");
    assert_eq!(log[2].details["reason"], "no_match");
    assert_eq!(log[3].details["reason"], "unknown");
    h.guard.stop_services();
}
