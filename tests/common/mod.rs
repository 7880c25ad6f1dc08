// Shared harness for integration tests: in-memory store, manual clock and
// in-memory artifact checker wired through the real service builder.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use phase_orchestrator::config::{CredentialMode, OrchestratorConfig, PhaseConfig};
use phase_orchestrator::reconciler::HealAlert;
use phase_orchestrator::runtime::MEMORY_STORE_URL;
use phase_orchestrator::{
    AlertSink, Clock, Collaborators, CompletionEvent, CompletionStatus, CompletionStore,
    InMemoryArtifactChecker, InMemoryCompletionStore, ManualClock, OrchestratorServices,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
}

pub fn phase(name: &str, processors: &[&str], max_wait_secs: u64) -> PhaseConfig {
    PhaseConfig {
        name: name.to_string(),
        expected_processors: processors.iter().map(|p| p.to_string()).collect(),
        max_wait_secs,
        entry_url: None,
        artifact_table: None,
        artifact_key_column: "partition_key".to_string(),
        min_rows: 1,
        aliases: BTreeMap::new(),
    }
}

pub fn config(phases: Vec<PhaseConfig>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        phases,
        ..Default::default()
    };
    config.store.url = MEMORY_STORE_URL.to_string();
    config.store.retry.max_attempts = 50;
    config.store.retry.base_delay_ms = 1;
    config.store.retry.max_delay_ms = 5;
    config.dispatch.credentials = CredentialMode::None;
    config.dispatch.request_timeout_secs = 5;
    config.reconciler.artifact_poll_interval_secs = 0;
    config.reconciler.artifact_poll_attempts = 3;
    config.reconciler.backoff_jitter_secs = 0;
    config
}

pub fn event(key: &str, processor: &str) -> CompletionEvent {
    CompletionEvent {
        partition_key: key.to_string(),
        processor_name: processor.to_string(),
        status: CompletionStatus::Success,
        correlation_id: Some(format!("corr-{key}")),
        output_table: None,
        record_count: Some(10),
    }
}

/// Alert sink that keeps every alert for assertions.
#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<HealAlert>>,
}

impl RecordingAlerts {
    pub fn count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn failed_heal(&self, alert: &HealAlert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

pub struct Harness {
    pub services: OrchestratorServices,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryCompletionStore>,
    pub artifacts: Arc<InMemoryArtifactChecker>,
    pub alerts: Arc<RecordingAlerts>,
}

pub async fn harness(config: OrchestratorConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(InMemoryCompletionStore::new());
    let artifacts = Arc::new(InMemoryArtifactChecker::new());
    let alerts = Arc::new(RecordingAlerts::default());

    let services = OrchestratorServices::build(
        &config,
        Collaborators {
            store: Some(store.clone() as Arc<dyn CompletionStore>),
            credentials: None,
            artifacts: Some(artifacts.clone()),
            alerts: Some(alerts.clone()),
            clock: Some(clock.clone() as Arc<dyn Clock>),
        },
    )
    .await
    .expect("services build");

    Harness {
        services,
        clock,
        store,
        artifacts,
        alerts,
    }
}
