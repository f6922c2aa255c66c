//! Anti-tamper checks driven through scripted host capabilities.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use wolfguard_core::{
    AntiTamperMonitor, CheckOutcome, GuardConfig, ManualClock, SecurityCheck, StaticAppIdentity,
    StaticDeviceInfo, Violation,
};
use wolfguard_keyring::MemoryStore;

use crate::common::{
    app, device, encryption, manual_clock, OffsetTimeSource, ScriptedProbe, SwappableDevice,
};

struct Harness {
    monitor: Arc<AntiTamperMonitor>,
    probe: Arc<ScriptedProbe>,
    device: Arc<SwappableDevice>,
}

async fn harness(config: GuardConfig, signature: &str) -> Harness {
    let enc = encryption(Arc::new(MemoryStore::new()), Arc::new(StaticDeviceInfo::new(device("tamper-dev")))).await;
    let probe = Arc::new(ScriptedProbe::default());
    let device = Arc::new(SwappableDevice::new(device("tamper-dev")));
    let monitor = AntiTamperMonitor::new(
        enc,
        device.clone(),
        Arc::new(StaticAppIdentity::new(app(signature))),
        probe.clone(),
        manual_clock(),
        &config,
    );
    monitor.initialize().await.unwrap();
    Harness {
        monitor: Arc::new(monitor),
        probe,
        device,
    }
}

async fn harness_with_time(clock: Arc<ManualClock>, offset: chrono::Duration) -> Arc<AntiTamperMonitor> {
    let enc = encryption(Arc::new(MemoryStore::new()), Arc::new(StaticDeviceInfo::new(device("tamper-dev")))).await;
    let monitor = AntiTamperMonitor::new(
        enc,
        Arc::new(StaticDeviceInfo::new(device("tamper-dev"))),
        Arc::new(StaticAppIdentity::new(app("sig"))),
        Arc::new(ScriptedProbe::default()),
        clock.clone(),
        &GuardConfig::default(),
    )
    .with_time_source(Arc::new(OffsetTimeSource { clock, offset }));
    monitor.initialize().await.unwrap();
    Arc::new(monitor)
}

#[tokio::test]
async fn test_clean_environment_passes() {
    let h = harness(GuardConfig::default(), "sig").await;
    let report = h.monitor.perform_security_checks().await.unwrap();

    assert!(report.passed());
    assert!(report.violation().is_none());
    let checks: Vec<_> = report.results.iter().map(|r| r.check).collect();
    assert_eq!(checks, SecurityCheck::ALL.to_vec());
}

#[tokio::test]
async fn test_probe_detections_fail_their_checks() {
    let h = harness(GuardConfig::default(), "sig").await;
    h.probe.rooted.store(true, Ordering::SeqCst);
    h.probe.debugger.store(true, Ordering::SeqCst);
    h.probe.emulator.store(true, Ordering::SeqCst);

    let report = h.monitor.perform_security_checks().await.unwrap();

    assert_eq!(
        report.failed_checks(),
        vec![SecurityCheck::Root, SecurityCheck::Debugger, SecurityCheck::Emulator]
    );
    assert_eq!(
        report.violation(),
        Some(Violation::Tamper {
            failed_checks: vec!["root".into(), "debugger".into(), "emulator".into()]
        })
    );
}

#[tokio::test]
async fn test_broken_probe_is_skipped_not_failed() {
    let h = harness(GuardConfig::default(), "sig").await;
    h.probe.broken.store(true, Ordering::SeqCst);

    let report = h.monitor.perform_security_checks().await.unwrap();

    assert!(report.passed());
    for check in [SecurityCheck::Root, SecurityCheck::Debugger, SecurityCheck::Emulator] {
        assert!(matches!(report.outcome(check), Some(CheckOutcome::Skipped { .. })));
    }
}

#[tokio::test]
async fn test_device_drift_detected() {
    let h = harness(GuardConfig::default(), "sig").await;
    let mut moved = device("tamper-dev");
    moved.model = "Generic x86".into();
    h.device.swap(moved);

    let report = h.monitor.perform_security_checks().await.unwrap();
    assert_eq!(report.failed_checks(), vec![SecurityCheck::DeviceDrift]);
}

#[tokio::test]
async fn test_expected_signature_enforced_case_insensitively() {
    let config = GuardConfig {
        expected_signature: Some("ABCDEF".into()),
        ..GuardConfig::default()
    };
    let h = harness(config.clone(), "abcdef").await;
    assert!(h.monitor.perform_security_checks().await.unwrap().passed());

    let h = harness(config, "123456").await;
    let report = h.monitor.perform_security_checks().await.unwrap();
    assert_eq!(report.failed_checks(), vec![SecurityCheck::AppIntegrity]);
    assert_eq!(
        report.outcome(SecurityCheck::AppIntegrity),
        Some(&CheckOutcome::Failed {
            reason: "unexpected signature".into()
        })
    );
}

#[tokio::test]
async fn test_unexpected_package_fails_integrity() {
    let config = GuardConfig {
        app_package: "com.wolf.other".into(),
        ..GuardConfig::default()
    };
    let h = harness(config, "sig").await;
    let report = h.monitor.perform_security_checks().await.unwrap();
    assert_eq!(report.failed_checks(), vec![SecurityCheck::AppIntegrity]);
}

#[tokio::test]
async fn test_clock_skew_within_tolerance_passes() {
    let monitor = harness_with_time(manual_clock(), chrono::Duration::minutes(4)).await;
    let report = monitor.perform_security_checks().await.unwrap();
    assert_eq!(report.outcome(SecurityCheck::ClockSkew), Some(&CheckOutcome::Passed));
}

#[tokio::test]
async fn test_clock_skew_beyond_tolerance_fails() {
    let monitor = harness_with_time(manual_clock(), chrono::Duration::minutes(-6)).await;
    let report = monitor.perform_security_checks().await.unwrap();
    assert_eq!(report.failed_checks(), vec![SecurityCheck::ClockSkew]);
}

#[tokio::test]
async fn test_report_serializes_outcomes() {
    let h = harness(GuardConfig::default(), "sig").await;
    h.probe.rooted.store(true, Ordering::SeqCst);
    let report = h.monitor.perform_security_checks().await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    let root = &json["results"][1];
    assert_eq!(root["check"], "root");
    assert_eq!(root["outcome"], "failed");
    assert_eq!(root["reason"], "rooted device");
}

#[tokio::test(start_paused = true)]
async fn test_periodic_monitor_reports_violation() {
    let h = harness(GuardConfig::default(), "sig").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.monitor.start(tx.clone());
    h.monitor.start(tx);
    assert!(h.monitor.is_running());

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(rx.try_recv().is_err());

    h.probe.debugger.store(true, Ordering::SeqCst);
    let violation = tokio::time::timeout(Duration::from_secs(61), rx.recv())
        .await
        .expect("no check within one interval")
        .unwrap();
    assert_eq!(
        violation,
        Violation::Tamper {
            failed_checks: vec!["debugger".into()]
        }
    );

    h.monitor.stop_service();
    assert!(!h.monitor.is_running());
}
