// SQLite completion store against a temporary database file.
#![cfg(feature = "database")]

use chrono::{Duration, TimeZone, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

use phase_orchestrator::config::StoreConfig;
use phase_orchestrator::observability::OrchestratorMetrics;
use phase_orchestrator::phase::{ExpectedProcessorSet, PhaseDefinition};
use phase_orchestrator::store::{
    CasResult, DispatchAttempt, DispatchOrigin, SqliteCompletionStore, TransactionRetryPolicy,
};
use phase_orchestrator::tracker::CompletionPayload;
use phase_orchestrator::{
    CompletionRecord, CompletionStatus, CompletionStore, CompletionTracker, HealthState,
    KeyHealth, ManualClock, Pipeline, TriggerDecision,
};

async fn open(dir: &TempDir) -> SqliteCompletionStore {
    let config = StoreConfig {
        url: format!("sqlite://{}", dir.path().join("completions.db").display()),
        max_connections: 5,
        auto_migrate: true,
        ..Default::default()
    };
    SqliteCompletionStore::connect(&config).await.unwrap()
}

fn record(phase: &str, key: &str) -> CompletionRecord {
    let mut record = CompletionRecord::empty(phase, key);
    record.last_activity_at = Some(Utc::now());
    record
}

fn attempt(success: bool) -> DispatchAttempt {
    DispatchAttempt {
        attempted_at: Utc::now(),
        target_phase: "phase3".to_string(),
        success,
        status_code: Some(if success { 200 } else { 502 }),
        error: (!success).then(|| "bad gateway".to_string()),
        bypass_upstream_check: false,
        origin: DispatchOrigin::Tracker,
        correlation_id: "corr-1".to_string(),
    }
}

#[tokio::test]
async fn compare_and_put_enforces_versions() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let fresh = record("phase2", "k");
    assert_eq!(
        store.compare_and_put(&fresh, 0).await.unwrap(),
        CasResult::Success { version: 1 }
    );
    assert_eq!(
        store.compare_and_put(&fresh, 0).await.unwrap(),
        CasResult::VersionConflict { actual: 1 }
    );

    let mut stored = store.get("phase2", "k").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    stored.triggered = true;
    assert!(store.compare_and_put(&stored, 1).await.unwrap().is_success());
    assert_eq!(
        store.compare_and_put(&stored, 1).await.unwrap(),
        CasResult::VersionConflict { actual: 2 }
    );

    let missing = record("phase2", "other");
    assert_eq!(
        store.compare_and_put(&missing, 4).await.unwrap(),
        CasResult::NotFound
    );
}

#[tokio::test]
async fn dispatch_audit_survives_record_updates() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store.compare_and_put(&record("phase2", "k"), 0).await.unwrap();

    store.record_dispatch("phase2", "k", attempt(false)).await.unwrap();
    store.record_dispatch("phase2", "k", attempt(true)).await.unwrap();
    // No record, no audit row.
    store.record_dispatch("phase2", "nope", attempt(true)).await.unwrap();

    let mut current = store.get("phase2", "k").await.unwrap().unwrap();
    current.completed_count = 1;
    store.compare_and_put(&current, current.version).await.unwrap();

    let reloaded = store.get("phase2", "k").await.unwrap().unwrap();
    assert_eq!(reloaded.dispatches.len(), 2);
    assert!(!reloaded.dispatches[0].success);
    assert!(reloaded.last_dispatch().unwrap().success);
    assert!(store.get("phase2", "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn archive_moves_expired_records_only() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let mut old = CompletionRecord::empty("phase2", "2024-01-01");
    old.last_activity_at = Some(Utc::now() - Duration::days(40));
    store.compare_and_put(&old, 0).await.unwrap();
    store
        .record_dispatch("phase2", "2024-01-01", attempt(true))
        .await
        .unwrap();
    store.compare_and_put(&record("phase2", "recent"), 0).await.unwrap();

    let moved = store
        .archive_before(Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert_eq!(store.archived_count().await.unwrap(), 1);
    assert!(store.get("phase2", "2024-01-01").await.unwrap().is_none());
    assert!(store.get("phase2", "recent").await.unwrap().is_some());

    let active = store
        .list_active(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].partition_key, "recent");
}

#[tokio::test]
async fn compare_and_delete_checks_version() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store.compare_and_put(&record("phase2", "k"), 0).await.unwrap();

    assert_eq!(
        store.compare_and_delete("phase2", "k", 7).await.unwrap(),
        CasResult::VersionConflict { actual: 1 }
    );
    assert!(store
        .compare_and_delete("phase2", "k", 1)
        .await
        .unwrap()
        .is_success());
    assert_eq!(
        store.compare_and_delete("phase2", "k", 1).await.unwrap(),
        CasResult::NotFound
    );
    assert_eq!(store.archived_count().await.unwrap(), 1);
}

#[tokio::test]
async fn versions_keep_rising_after_delete() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let mut original = record("phase2", "k");
    original.completed_count = 99;
    store.compare_and_put(&original, 0).await.unwrap();
    let stale = store.get("phase2", "k").await.unwrap().unwrap();
    assert!(store
        .compare_and_delete("phase2", "k", stale.version)
        .await
        .unwrap()
        .is_success());

    assert_eq!(
        store.compare_and_put(&record("phase2", "k"), 0).await.unwrap(),
        CasResult::Success { version: 2 }
    );
    assert_eq!(
        store.compare_and_put(&stale, stale.version).await.unwrap(),
        CasResult::VersionConflict { actual: 2 }
    );
    let current = store.get("phase2", "k").await.unwrap().unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.completed_count, 0);
}

#[tokio::test]
async fn health_round_trips_and_clears() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let mut health = KeyHealth::new("k", now);
    health.transition(HealthState::MissingOutput, now);
    health.heal_attempts = 2;
    health.broken_phase = Some("phase3".to_string());
    health.next_check_at = Some(now + Duration::minutes(30));
    store.save_health(&health).await.unwrap();

    health.transition(HealthState::Healing, now);
    store.save_health(&health).await.unwrap();

    let loaded = store.load_health("k").await.unwrap().unwrap();
    assert_eq!(loaded, health);
    assert!(store.clear_health("k").await.unwrap());
    assert!(!store.clear_health("k").await.unwrap());
    assert!(store.load_health("k").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tracker_over_sqlite_triggers_once() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn CompletionStore> = Arc::new(open(&dir).await);
    let names: Vec<String> = (0..6).map(|i| format!("proc_{i}")).collect();
    let pipeline = Arc::new(Pipeline::new(vec![PhaseDefinition::new(
        "phase2",
        ExpectedProcessorSet::new(names.clone(), Duration::hours(1)),
    )]));
    let tracker = Arc::new(CompletionTracker::new(
        store.clone(),
        pipeline,
        Arc::new(ManualClock::new(Utc::now())),
        TransactionRetryPolicy {
            max_attempts: 50,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(10),
            jitter: true,
        },
        Arc::new(OrchestratorMetrics::new()),
    ));

    let tasks = names.into_iter().map(|name| {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let payload = CompletionPayload {
                correlation_id: name.clone(),
                status: CompletionStatus::Success,
                output_table: None,
                record_count: None,
            };
            tracker
                .record_completion("phase2", "k", &name, payload)
                .await
        })
    });
    let decisions: Vec<TriggerDecision> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(decisions.iter().filter(|d| d.plan().is_some()).count(), 1);
    let stored = store.get("phase2", "k").await.unwrap().unwrap();
    assert!(stored.triggered);
    assert_eq!(stored.completed_count, 6);
}
