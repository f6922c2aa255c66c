//! Login throttling, injection heuristics, burst detection and log bounds.

use std::sync::Arc;

use serde_json::json;
use wolfguard_core::intrusion::kinds;
use wolfguard_core::{
    GuardConfig, InjectionCategory, IntrusionDetector, ManualClock, ResponseAction, ResponsePolicy,
    StaticDeviceInfo, SuspiciousActivity,
};
use wolfguard_keyring::MemoryStore;

use crate::common::{device, encryption, manual_clock};

async fn detector_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> IntrusionDetector {
    let enc = encryption(store, Arc::new(StaticDeviceInfo::new(device("device-ids")))).await;
    let detector = IntrusionDetector::new(enc, clock, &GuardConfig::default());
    detector.initialize().await.unwrap();
    detector
}

async fn detector() -> (IntrusionDetector, Arc<ManualClock>) {
    let clock = manual_clock();
    (detector_with(Arc::new(MemoryStore::new()), clock.clone()).await, clock)
}

// =============================================================================
// Login throttling
// =============================================================================

#[tokio::test]
async fn test_lockout_after_max_failures_records_one_entry() {
    let (ids, _clock) = detector().await;

    for _ in 0..4 {
        assert!(ids.record_login_attempt("mallory", false, json!({})).await);
    }
    assert!(!ids.record_login_attempt("mallory", false, json!({})).await);
    assert!(!ids.record_login_attempt("mallory", false, json!({})).await);
    assert!(!ids.record_login_attempt("mallory", false, json!({})).await);

    let suspicious = ids.suspicious_activities().await;
    let excessive: Vec<_> = suspicious
        .iter()
        .filter(|e| e.kind == kinds::EXCESSIVE_LOGIN_ATTEMPTS)
        .collect();
    assert_eq!(excessive.len(), 1);
    assert_eq!(excessive[0].detail_str("userId"), Some("mallory"));
    assert_eq!(ids.activity_log().await.len(), 7);
}

#[tokio::test]
async fn test_success_resets_counter() {
    let (ids, _clock) = detector().await;
    for _ in 0..3 {
        ids.record_login_attempt("alice", false, json!({})).await;
    }
    assert_eq!(ids.login_attempt_count("alice").await, 3);

    assert!(ids.record_login_attempt("alice", true, json!({})).await);
    assert_eq!(ids.login_attempt_count("alice").await, 0);
}

#[tokio::test]
async fn test_counter_resets_after_idle_window() {
    let (ids, clock) = detector().await;
    for _ in 0..3 {
        ids.record_login_attempt("alice", false, json!({})).await;
    }

    clock.advance(chrono::Duration::minutes(31));
    assert_eq!(ids.login_attempt_count("alice").await, 0);
    assert!(ids.record_login_attempt("alice", false, json!({})).await);
    assert_eq!(ids.login_attempt_count("alice").await, 1);
}

#[tokio::test]
async fn test_lockout_clears_after_idle_window() {
    let (ids, clock) = detector().await;
    for _ in 0..5 {
        ids.record_login_attempt("mallory", false, json!({})).await;
    }
    assert!(!ids.record_login_attempt("mallory", false, json!({})).await);

    clock.advance(chrono::Duration::minutes(31));
    assert!(ids.record_login_attempt("mallory", false, json!({})).await);
}

#[tokio::test]
async fn test_users_are_throttled_independently() {
    let (ids, _clock) = detector().await;
    for _ in 0..5 {
        ids.record_login_attempt("mallory", false, json!({})).await;
    }
    assert!(ids.record_login_attempt("alice", false, json!({})).await);
}

#[tokio::test]
async fn test_attempt_details_are_merged() {
    let (ids, _clock) = detector().await;
    ids.record_login_attempt("alice", false, json!({ "ip": "10.0.0.7" }))
        .await;

    let log = ids.activity_log().await;
    assert_eq!(log[0].kind, kinds::LOGIN_FAILURE);
    assert_eq!(log[0].detail_str("ip"), Some("10.0.0.7"));
    assert_eq!(log[0].detail_str("userId"), Some("alice"));
}

// =============================================================================
// Injection and burst detection
// =============================================================================

#[tokio::test]
async fn test_sql_injection_flagged() {
    let (ids, _clock) = detector().await;
    assert!(ids.detect_injection_attack("' OR '1'='1").await);

    let suspicious = ids.suspicious_activities().await;
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].kind, kinds::INJECTION_ATTEMPT);
    assert_eq!(suspicious[0].detail_str("category"), Some("sql"));
}

#[tokio::test]
async fn test_benign_input_not_flagged() {
    let (ids, _clock) = detector().await;
    for input in ["hello world", "user@example.com", "select a plan", "2 + 2 is 4"] {
        assert!(!ids.detect_injection_attack(input).await, "flagged {input:?}");
    }
    assert!(ids.suspicious_activities().await.is_empty());
}

#[test]
fn test_injection_classification() {
    assert_eq!(
        IntrusionDetector::classify_injection("<script>alert(1)</script>"),
        Some(InjectionCategory::Xss)
    );
    assert_eq!(
        IntrusionDetector::classify_injection("name;cat /etc/passwd"),
        Some(InjectionCategory::Command)
    );
    assert_eq!(
        IntrusionDetector::classify_injection("admin'--"),
        Some(InjectionCategory::Sql)
    );
    assert_eq!(IntrusionDetector::classify_injection("plain text"), None);
}

#[tokio::test]
async fn test_brute_force_threshold() {
    let (ids, _clock) = detector().await;

    assert!(!ids.detect_brute_force_attack(10, 1000, "/login").await);
    assert!(ids.detect_brute_force_attack(11, 1000, "/login").await);
    assert!(ids.detect_brute_force_attack(1, 0, "/login").await);
    assert!(!ids.detect_brute_force_attack(0, 0, "/login").await);

    let suspicious = ids.suspicious_activities().await;
    assert_eq!(suspicious.len(), 2);
    assert!(suspicious.iter().all(|e| e.kind == kinds::BRUTE_FORCE_ATTEMPT));
    assert_eq!(suspicious[0].detail_str("endpoint"), Some("/login"));
}

// =============================================================================
// Logs and policy
// =============================================================================

#[tokio::test]
async fn test_logs_keep_newest_hundred() {
    let (ids, _clock) = detector().await;
    for i in 0..130 {
        ids.log_activity("tick", json!({ "n": i })).await;
    }

    let log = ids.activity_log().await;
    assert_eq!(log.len(), 100);
    assert_eq!(log[0].details["n"], 30);
    assert_eq!(log[99].details["n"], 129);
}

#[tokio::test]
async fn test_logs_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    {
        let ids = detector_with(store.clone(), clock.clone()).await;
        ids.detect_injection_attack("<script>x</script>").await;
        ids.log_activity("note", json!({})).await;
    }

    let ids = detector_with(store, clock).await;
    assert_eq!(ids.suspicious_activities().await.len(), 1);
    assert_eq!(ids.activity_log().await.len(), 1);
}

#[tokio::test]
async fn test_clear_suspicious_activities() {
    let (ids, _clock) = detector().await;
    ids.detect_injection_attack("' OR 1=1 --").await;
    ids.clear_suspicious_activities().await;
    assert!(ids.suspicious_activities().await.is_empty());
}

struct AlwaysAlert;

impl ResponsePolicy for AlwaysAlert {
    fn respond(&self, _activity: &SuspiciousActivity) -> ResponseAction {
        ResponseAction::Alert
    }
}

#[tokio::test]
async fn test_default_and_custom_response_policy() {
    let (ids, _clock) = detector().await;

    let action = ids
        .record_suspicious_activity(kinds::EXCESSIVE_LOGIN_ATTEMPTS, json!({ "userId": "eve" }))
        .await;
    assert_eq!(action, ResponseAction::BlockUser { user_id: "eve".into() });
    let action = ids
        .record_suspicious_activity(kinds::INJECTION_ATTEMPT, json!({}))
        .await;
    assert_eq!(action, ResponseAction::RejectRequest);

    ids.set_response_policy(Arc::new(AlwaysAlert)).await;
    let action = ids
        .record_suspicious_activity(kinds::EXCESSIVE_LOGIN_ATTEMPTS, json!({ "userId": "eve" }))
        .await;
    assert_eq!(action, ResponseAction::Alert);
}

#[tokio::test]
async fn test_policy_decision_kept_with_detector_entries() {
    let (ids, _clock) = detector().await;
    for _ in 0..5 {
        ids.record_login_attempt("mallory", false, json!({})).await;
    }
    assert!(ids.detect_injection_attack("<script>alert(1)</script>").await);

    ids.set_response_policy(Arc::new(AlwaysAlert)).await;
    assert!(ids.detect_brute_force_attack(50, 1000, "/login").await);

    let responses: Vec<_> = ids
        .suspicious_activities()
        .await
        .into_iter()
        .map(|e| e.details["response"].clone())
        .collect();
    assert_eq!(
        responses,
        vec![
            json!({ "action": "block_user", "user_id": "mallory" }),
            json!({ "action": "reject_request" }),
            json!({ "action": "alert" }),
        ]
    );
}
