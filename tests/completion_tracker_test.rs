// Completion tracking through the public tracker API: idempotency,
// exactly-once triggering under concurrency, and timeout windows.

mod common;

use chrono::Duration;
use futures::future::join_all;
use std::sync::Arc;

use common::{config, harness, phase};
use phase_orchestrator::tracker::CompletionPayload;
use phase_orchestrator::{CompletionStatus, CompletionStore, TriggerDecision, TriggerReason};

fn payload(correlation: &str) -> CompletionPayload {
    CompletionPayload {
        correlation_id: correlation.to_string(),
        status: CompletionStatus::Success,
        output_table: None,
        record_count: Some(1),
    }
}

#[tokio::test]
async fn duplicate_completion_is_already_registered_and_writes_nothing() {
    let h = harness(config(vec![phase("phase2", &["a", "b"], 3_600)])).await;
    let tracker = &h.services.tracker;

    let first = tracker
        .record_completion("phase2", "2024-03-01", "a", payload("c1"))
        .await
        .unwrap();
    assert_eq!(
        first,
        TriggerDecision::Waiting {
            completed: 1,
            expected: 2
        }
    );
    let before = h.store.get("phase2", "2024-03-01").await.unwrap().unwrap();

    let again = tracker
        .record_completion("phase2", "2024-03-01", "a", payload("c2"))
        .await
        .unwrap();
    assert_eq!(
        again,
        TriggerDecision::AlreadyRegistered {
            processor: "a".to_string()
        }
    );

    let after = h.store.get("phase2", "2024-03-01").await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(h.services.metrics.get_stats().duplicate_completions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_trigger_exactly_once() {
    let processors: Vec<String> = (0..8).map(|i| format!("proc_{i}")).collect();
    let names: Vec<&str> = processors.iter().map(String::as_str).collect();
    let h = harness(config(vec![phase("phase3", &names, 3_600)])).await;
    let tracker = h.services.tracker.clone();

    let tasks = processors.iter().cloned().map(|name| {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            tracker
                .record_completion("phase3", "2024-03-01", &name, payload(&name))
                .await
        })
    });
    let decisions: Vec<TriggerDecision> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let triggers: Vec<_> = decisions.iter().filter_map(TriggerDecision::plan).collect();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].reason, TriggerReason::AllComplete);
    assert!(triggers[0].missing.is_empty());

    let record = h.store.get("phase3", "2024-03-01").await.unwrap().unwrap();
    assert!(record.triggered);
    assert_eq!(record.completed_count, 8);
    assert_eq!(record.trigger_reason, Some(TriggerReason::AllComplete));
}

#[tokio::test]
async fn timeout_window_is_inclusive() {
    let h = harness(config(vec![phase("phase2", &["a", "b", "c"], 60)])).await;
    let tracker = &h.services.tracker;

    tracker
        .record_completion("phase2", "k", "a", payload("c1"))
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(59));
    let early = tracker.evaluate_timeout("phase2", "k").await.unwrap();
    assert!(matches!(early, TriggerDecision::Waiting { completed: 1, .. }));

    h.clock.advance(Duration::seconds(1));
    let due = tracker.evaluate_timeout("phase2", "k").await.unwrap();
    let plan = due.plan().expect("timeout trigger at the window edge");
    assert_eq!(plan.reason, TriggerReason::Timeout);
    assert_eq!(plan.missing, vec!["b".to_string(), "c".to_string()]);

    h.clock.advance(Duration::seconds(1));
    let later = tracker.evaluate_timeout("phase2", "k").await.unwrap();
    assert_eq!(later, TriggerDecision::AlreadyTriggered { processor: None });
}

#[tokio::test]
async fn completion_arriving_after_window_triggers_on_timeout() {
    let h = harness(config(vec![phase("phase2", &["a", "b", "c"], 60)])).await;
    let tracker = &h.services.tracker;

    tracker
        .record_completion("phase2", "k", "a", payload("c1"))
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(61));

    let decision = tracker
        .record_completion("phase2", "k", "b", payload("c2"))
        .await
        .unwrap();
    let plan = decision.plan().expect("late completion closes the window");
    assert_eq!(plan.reason, TriggerReason::Timeout);
    assert_eq!(plan.missing, vec!["c".to_string()]);
}

#[tokio::test]
async fn unknown_processor_is_ignored_without_touching_state() {
    let h = harness(config(vec![phase("phase2", &["a", "b"], 60)])).await;
    let tracker = &h.services.tracker;

    let decision = tracker
        .record_completion("phase2", "k", "SomethingElseEntirely", payload("c1"))
        .await
        .unwrap();
    assert!(matches!(decision, TriggerDecision::Ignored { .. }));
    assert!(h.store.get("phase2", "k").await.unwrap().is_none());

    let decision = tracker
        .record_completion("phase2", "k", "AProcessor", payload("c2"))
        .await
        .unwrap();
    assert!(matches!(decision, TriggerDecision::Waiting { completed: 1, .. }));
    assert_eq!(h.services.metrics.get_stats().events_ignored, 1);
}

#[tokio::test]
async fn keys_and_phases_are_tracked_independently() {
    let h = harness(config(vec![
        phase("phase2", &["a"], 60),
        phase("phase3", &["a", "b"], 60),
    ]))
    .await;
    let tracker = &h.services.tracker;

    let p2 = tracker
        .record_completion("phase2", "k1", "a", payload("c1"))
        .await
        .unwrap();
    assert!(p2.plan().is_some());

    let p3 = tracker
        .record_completion("phase3", "k1", "a", payload("c1"))
        .await
        .unwrap();
    assert!(matches!(p3, TriggerDecision::Waiting { .. }));

    let other_key = tracker
        .record_completion("phase2", "k2", "a", payload("c3"))
        .await
        .unwrap();
    assert!(other_key.plan().is_some());
}

#[tokio::test]
async fn two_of_three_then_single_timeout_trigger_at_61s() {
    let h = harness(config(vec![phase("phase2", &["a", "b", "c"], 60)])).await;
    let tracker = &h.services.tracker;

    for name in ["a", "b"] {
        let decision = tracker
            .record_completion("phase2", "k", name, payload(name))
            .await
            .unwrap();
        assert!(matches!(decision, TriggerDecision::Waiting { .. }));
    }

    h.clock.advance(Duration::seconds(61));
    let decisions = join_all((0..4).map(|_| tracker.evaluate_timeout("phase2", "k"))).await;
    let plans: Vec<_> = decisions
        .iter()
        .map(|d| d.as_ref().unwrap())
        .filter_map(TriggerDecision::plan)
        .collect();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].reason, TriggerReason::Timeout);
    assert_eq!(plans[0].missing, vec!["c".to_string()]);
    assert_eq!(h.services.metrics.get_stats().triggers_timeout, 1);
}
