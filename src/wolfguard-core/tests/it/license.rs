//! License verification: online path, offline fallback and periodic re-checks.

use std::sync::Arc;
use std::time::Duration;

use wolfguard_core::{
    Clock, GuardConfig, GuardError, LicenseResponse, LicenseState, LicenseVerifier, ManualClock,
    StaticDeviceInfo, StaticNetwork, VerdictSource, Violation,
};
use wolfguard_keyring::MemoryStore;

use crate::common::{device, encryption, manual_clock, valid_response, MockTransport, SwappableDevice};

const KEY: &str = "WOLF-1234-5678";

struct Harness {
    verifier: Arc<LicenseVerifier>,
    transport: Arc<MockTransport>,
    network: Arc<StaticNetwork>,
    device: Arc<SwappableDevice>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

async fn harness_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Harness {
    let enc = encryption(store.clone(), Arc::new(StaticDeviceInfo::new(device("lic-device")))).await;
    let transport = Arc::new(MockTransport::new());
    let network = Arc::new(StaticNetwork::new(true));
    let device = Arc::new(SwappableDevice::new(device("lic-device")));
    let verifier = Arc::new(LicenseVerifier::new(
        enc,
        transport.clone(),
        network.clone(),
        device.clone(),
        clock.clone(),
        &GuardConfig::default(),
    ));
    verifier.initialize().await.unwrap();
    Harness {
        verifier,
        transport,
        network,
        device,
        clock,
        store,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), manual_clock()).await
}

/// Verify online once, then go offline.
async fn verified_then_offline(expiry: &str) -> Harness {
    let h = harness().await;
    h.transport.respond(valid_response(expiry));
    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();
    assert!(verdict.is_valid);
    h.network.set_connected(false);
    h
}

fn rejected(message: &str) -> LicenseResponse {
    LicenseResponse {
        is_valid: false,
        license_info: None,
        message: Some(message.to_string()),
    }
}

// =============================================================================
// Online path
// =============================================================================

#[tokio::test]
async fn test_online_valid_caches_record() {
    let h = harness().await;
    h.transport.respond(valid_response("2030-01-01"));

    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(verdict.is_valid);
    assert_eq!(verdict.source, VerdictSource::Online);
    assert_eq!(verdict.message, "License is valid");
    assert_eq!(h.verifier.state().await, LicenseState::OnlineValid);

    let record = h.verifier.license_record().await.unwrap();
    assert_eq!(record.license_key, KEY);
    assert_eq!(record.device_id, "lic-device");
    assert_eq!(record.last_online_check_at, h.clock.now());
    assert_eq!(record.license_info["plan"], "pro");
    assert_eq!(h.verifier.stored_license_key().await.as_deref(), Some(KEY));
}

#[tokio::test]
async fn test_request_carries_key_and_device_info() {
    let h = harness().await;
    h.transport.respond(valid_response("2030-01-01"));
    h.verifier.verify_license(KEY, false).await.unwrap();

    let request = h.transport.requests.lock().unwrap()[0].clone();
    let body = serde_json::to_value(&request).unwrap();
    assert_eq!(body["licenseKey"], KEY);
    assert_eq!(body["deviceInfo"]["deviceId"], "lic-device");
    assert_eq!(body["deviceInfo"]["platform"], "android");
    assert_eq!(body["deviceInfo"]["appVersion"], "2.1.0");
    assert_eq!(body["deviceInfo"]["buildNumber"], "210");
}

#[tokio::test]
async fn test_online_rejection_is_not_cached() {
    let h = harness().await;
    h.transport.respond(rejected("License revoked"));

    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.source, VerdictSource::Online);
    assert_eq!(verdict.message, "License revoked");
    assert!(h.verifier.license_record().await.is_none());
    assert_eq!(h.verifier.state().await, LicenseState::Unverified);
}

#[tokio::test]
async fn test_cached_record_skips_network_unless_forced() {
    let h = harness().await;
    h.transport.respond(valid_response("2030-01-01"));
    h.verifier.verify_license(KEY, false).await.unwrap();
    assert_eq!(h.transport.request_count(), 1);

    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();
    assert_eq!(verdict.source, VerdictSource::Offline);
    assert_eq!(h.transport.request_count(), 1);

    h.transport.respond(valid_response("2030-01-01"));
    let verdict = h.verifier.verify_license(KEY, true).await.unwrap();
    assert_eq!(verdict.source, VerdictSource::Online);
    assert_eq!(h.transport.request_count(), 2);
}

#[tokio::test]
async fn test_network_failure_falls_back_offline() {
    let h = harness().await;
    h.transport.respond(valid_response("2030-01-01"));
    h.verifier.verify_license(KEY, false).await.unwrap();

    h.transport.fail("connection reset");
    let verdict = h.verifier.verify_license(KEY, true).await.unwrap();

    assert!(verdict.is_valid);
    assert_eq!(verdict.source, VerdictSource::Offline);
    assert_eq!(h.verifier.state().await, LicenseState::OfflineValid);
}

// =============================================================================
// Offline path
// =============================================================================

#[tokio::test]
async fn test_offline_within_grace_period() {
    let h = verified_then_offline("2030-01-01").await;

    h.clock.advance(chrono::Duration::days(6));
    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(verdict.is_valid);
    assert_eq!(verdict.source, VerdictSource::Offline);
    assert_eq!(h.verifier.state().await, LicenseState::OfflineValid);
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_offline_beyond_grace_period_rejected() {
    let h = verified_then_offline("2030-01-01").await;

    h.clock.advance(chrono::Duration::days(8));
    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(
        verdict.message,
        "Offline grace period exceeded. Please connect to the internet to verify the license."
    );
    assert_eq!(h.verifier.state().await, LicenseState::Expired);
}

#[tokio::test]
async fn test_offline_expired_license() {
    let h = verified_then_offline("2025-06-20").await;

    h.clock.advance(chrono::Duration::days(6));
    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.message, "License has expired");
    assert_eq!(h.verifier.state().await, LicenseState::Expired);
}

#[tokio::test]
async fn test_offline_key_mismatch() {
    let h = verified_then_offline("2030-01-01").await;

    let verdict = h.verifier.verify_license("WOLF-0000-0000", false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.message, "License key does not match");
}

#[tokio::test]
async fn test_offline_device_mismatch() {
    let h = verified_then_offline("2030-01-01").await;
    h.device.swap(device("other-device"));

    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.message, "Device id does not match");
}

#[tokio::test]
async fn test_offline_without_record() {
    let h = harness().await;
    h.network.set_connected(false);

    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.source, VerdictSource::Offline);
    assert_eq!(
        verdict.message,
        "No license information found. Please verify the license online."
    );
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_record_survives_restart() {
    let h = verified_then_offline("2030-01-01").await;
    let (store, clock) = (h.store.clone(), h.clock.clone());
    drop(h);

    let h = harness_with(store, clock).await;
    h.network.set_connected(false);
    let verdict = h.verifier.verify_license(KEY, false).await.unwrap();
    assert!(verdict.is_valid);
}

// =============================================================================
// Edge cases and lifecycle
// =============================================================================

#[tokio::test]
async fn test_empty_key_rejected_without_request() {
    let h = harness().await;
    let verdict = h.verifier.verify_license("  ", true).await.unwrap();

    assert!(!verdict.is_valid);
    assert_eq!(verdict.message, "License key is empty");
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_verify_before_initialize_fails() {
    let enc = encryption(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticDeviceInfo::new(device("lic-device"))),
    )
    .await;
    let verifier = LicenseVerifier::new(
        enc,
        Arc::new(MockTransport::new()),
        Arc::new(StaticNetwork::new(true)),
        Arc::new(StaticDeviceInfo::new(device("lic-device"))),
        manual_clock(),
        &GuardConfig::default(),
    );

    let err = verifier.verify_license(KEY, false).await.unwrap_err();
    assert!(matches!(err, GuardError::NotInitialized { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_reports_revoked_license() {
    let h = harness().await;
    h.transport.respond(valid_response("2030-01-01"));
    h.verifier.verify_license(KEY, false).await.unwrap();
    h.transport.respond(rejected("License revoked"));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.verifier.start(tx);
    assert!(h.verifier.is_running());

    let violation = tokio::time::timeout(Duration::from_secs(25 * 60 * 60), rx.recv())
        .await
        .expect("periodic check did not run")
        .unwrap();
    assert_eq!(
        violation,
        Violation::License {
            reason: "License revoked".into()
        }
    );
    assert_eq!(h.transport.request_count(), 2);

    h.verifier.stop_service();
    assert!(!h.verifier.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_silent_without_stored_key() {
    let h = harness().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.verifier.start(tx);

    tokio::time::sleep(Duration::from_secs(49 * 60 * 60)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(h.transport.request_count(), 0);
    h.verifier.stop_service();
}
