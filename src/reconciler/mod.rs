//! Self-heal reconciler.
//!
//! A sweep compares what the completion store says happened for each recent
//! partition key against what actually landed in the phase output tables, and
//! re-drives the pipeline from the earliest phase whose output is missing.
//!
//! Per-key state lives in [`KeyHealth`]:
//!
//! ```text
//! healthy ──(stale upstream)──> stale_running ──┐
//!    ^    ──(output missing)──> missing_output ─┴─> healing ──(verified)──> healthy
//!    │                                                  │
//!    └──────(artifacts appear / operator reset)──── failed_heal <──(attempts exhausted)
//! ```
//!
//! Failed heal attempts back off exponentially per key. A `failed_heal` key is
//! only re-observed while the same phase stays broken; it is repaired again
//! after an operator reset or once a different phase is the broken one.

pub mod alert;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use crate::artifacts::{phase_output_present, ArtifactChecker};
use crate::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::dispatch::{TriggerDispatcher, TriggerRequest};
use crate::error::OrchestratorError;
use crate::health::{HealthState, KeyHealth};
use crate::observability::OrchestratorMetrics;
use crate::phase::Pipeline;
use crate::store::{
    CasResult, CompletionRecord, CompletionStore, DispatchAttempt, DispatchOrigin, TriggerReason,
};
use crate::telemetry::{generate_correlation_id, sweep_span};
use crate::tracker::{CompletionTracker, TriggerDecision, TriggerPlan};

pub use alert::{AlertSink, HealAlert, LogAlertSink};

/// What one look at a key found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Healthy,
    /// Output missing but still inside the staleness or grace window.
    Pending { phase: String },
    /// Upstream bookkeeping stopped moving. `clear` names the record to drop.
    StaleRunning {
        phase: String,
        clear: Option<(String, u64)>,
    },
    MissingOutput { phase: String },
    /// Stuck, but some phase from the broken one onward cannot be triggered.
    Unhealable { phase: String, reason: String },
}

impl Observation {
    /// The broken phase, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            Observation::Healthy => None,
            Observation::Pending { phase }
            | Observation::StaleRunning { phase, .. }
            | Observation::MissingOutput { phase }
            | Observation::Unhealable { phase, .. } => Some(phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KeyOutcome {
    Healthy,
    Recovered,
    Pending { phase: String },
    BackedOff { until: DateTime<Utc> },
    SkippedFailedHeal,
    /// Upstream record changed between observation and clearing.
    Contended { phase: String },
    Healed { from_phase: String },
    HealFailed {
        phase: String,
        attempts: u32,
        next_check_at: DateTime<Utc>,
    },
    FailedHeal { phase: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub partition_key: String,
    #[serde(flatten)]
    pub outcome: KeyOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub partition_key: String,
    pub phase: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweep_id: String,
    pub started_at: DateTime<Utc>,
    pub timeout_triggers: Vec<TriggerPlan>,
    pub keys: Vec<KeyReport>,
    pub archived: u64,
    pub errors: Vec<SweepError>,
}

impl SweepReport {
    pub fn count(&self, predicate: impl Fn(&KeyOutcome) -> bool) -> usize {
        self.keys.iter().filter(|k| predicate(&k.outcome)).count()
    }

    pub fn outcome_for(&self, partition_key: &str) -> Option<&KeyOutcome> {
        self.keys
            .iter()
            .find(|k| k.partition_key == partition_key)
            .map(|k| &k.outcome)
    }
}

/// Everything the store knows about one key, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub partition_key: String,
    pub health: Option<KeyHealth>,
    pub records: Vec<CompletionRecord>,
}

pub struct SelfHealReconciler {
    store: Arc<dyn CompletionStore>,
    pipeline: Arc<Pipeline>,
    tracker: Arc<CompletionTracker>,
    dispatcher: Arc<TriggerDispatcher>,
    artifacts: Arc<dyn ArtifactChecker>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    metrics: Arc<OrchestratorMetrics>,
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl SelfHealReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CompletionStore>,
        pipeline: Arc<Pipeline>,
        tracker: Arc<CompletionTracker>,
        dispatcher: Arc<TriggerDispatcher>,
        artifacts: Arc<dyn ArtifactChecker>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            pipeline,
            tracker,
            dispatcher,
            artifacts,
            alerts,
            clock,
            config,
            metrics,
        }
    }

    /// Delay before the next check after `attempts` failed heals.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let base = self.config.backoff_base_secs.saturating_mul(1u64 << exponent);
        let capped = base.min(self.config.backoff_max_secs);
        let jitter = if self.config.backoff_jitter_secs > 0 {
            rand::rng().random_range(0..=self.config.backoff_jitter_secs)
        } else {
            0
        };
        secs(capped.saturating_add(jitter))
    }

    /// One reconciliation pass over recent keys plus `explicit_keys`.
    pub async fn sweep(&self, explicit_keys: &[String]) -> Result<SweepReport, OrchestratorError> {
        let sweep_id = generate_correlation_id();
        let span = sweep_span(&sweep_id);
        self.sweep_inner(sweep_id, explicit_keys).instrument(span).await
    }

    async fn sweep_inner(
        &self,
        sweep_id: String,
        explicit_keys: &[String],
    ) -> Result<SweepReport, OrchestratorError> {
        let started_at = self.clock.now();
        let lookback = secs(self.config.lookback_hours.saturating_mul(3_600));
        let active = self.store.list_active(window_start(started_at, lookback)).await?;
        info!(active = active.len(), explicit = explicit_keys.len(), "Starting self-heal sweep");

        let mut report = SweepReport {
            sweep_id: sweep_id.clone(),
            started_at,
            timeout_triggers: Vec::new(),
            keys: Vec::new(),
            archived: 0,
            errors: Vec::new(),
        };

        for record in active.iter().filter(|r| !r.triggered) {
            if let Err(err) = self.advance_on_timeout(record, &mut report).await {
                report.errors.push(SweepError {
                    partition_key: record.partition_key.clone(),
                    phase: Some(record.phase.clone()),
                    message: err.to_string(),
                });
            }
        }

        let keys: BTreeSet<String> = active
            .iter()
            .map(|r| r.partition_key.clone())
            .chain(explicit_keys.iter().cloned())
            .collect();

        for key in keys {
            match self.reconcile_key(&key, &sweep_id).await {
                Ok(outcome) => report.keys.push(KeyReport {
                    partition_key: key,
                    outcome,
                }),
                Err(err) => {
                    warn!(partition_key = %key, error = %err, "Reconciliation failed for key");
                    report.errors.push(SweepError {
                        partition_key: key,
                        phase: None,
                        message: err.to_string(),
                    });
                }
            }
        }

        let retention = secs(self.config.retention_days.saturating_mul(86_400));
        match self
            .store
            .archive_before(window_start(self.clock.now(), retention))
            .await
        {
            Ok(archived) => report.archived = archived,
            Err(err) => report.errors.push(SweepError {
                partition_key: String::new(),
                phase: None,
                message: format!("retention archive failed: {err}"),
            }),
        }

        info!(
            keys = report.keys.len(),
            timeout_triggers = report.timeout_triggers.len(),
            archived = report.archived,
            errors = report.errors.len(),
            "Self-heal sweep finished"
        );
        self.metrics.log_stats();
        Ok(report)
    }

    async fn advance_on_timeout(
        &self,
        record: &CompletionRecord,
        report: &mut SweepReport,
    ) -> Result<(), OrchestratorError> {
        if self.pipeline.get(&record.phase).is_none() {
            debug!(phase = %record.phase, "Record for phase no longer configured");
            return Ok(());
        }
        let decision = self
            .tracker
            .evaluate_timeout(&record.phase, &record.partition_key)
            .await?;
        if let TriggerDecision::Trigger(plan) = decision {
            self.dispatcher
                .dispatch(&plan, DispatchOrigin::TimeoutSweep)
                .await;
            report.timeout_triggers.push(plan);
        }
        Ok(())
    }

    /// Classify a key without changing anything.
    pub async fn observe(&self, partition_key: &str) -> Result<Observation, OrchestratorError> {
        let mut broken = None;
        for phase in self.pipeline.phases() {
            if !phase_output_present(self.artifacts.as_ref(), phase, partition_key).await? {
                broken = Some(phase);
                break;
            }
        }
        let Some(broken) = broken else {
            return Ok(Observation::Healthy);
        };
        let phase = broken.name().to_string();

        // The record that starts `broken`: its upstream's, or its own for the first phase.
        let driving_phase = self
            .pipeline
            .previous(broken.name())
            .unwrap_or(broken)
            .name();
        let now = self.clock.now();
        let observation = match self.store.get(driving_phase, partition_key).await? {
            None => Observation::StaleRunning { phase, clear: None },
            Some(record) if record.triggered => {
                let triggered_at = record.triggered_at.unwrap_or(now);
                if now - triggered_at < secs(self.config.grace_secs) {
                    return Ok(Observation::Pending { phase });
                }
                Observation::MissingOutput { phase }
            }
            Some(record) => {
                let stale = record
                    .last_activity_at
                    .is_none_or(|at| now - at >= secs(self.config.staleness_secs));
                if !stale {
                    return Ok(Observation::Pending { phase });
                }
                Observation::StaleRunning {
                    phase,
                    clear: Some((record.phase.clone(), record.version)),
                }
            }
        };

        // Only a key that is actually stuck can be unhealable.
        if let Some(missing_entry) = self
            .pipeline
            .from_phase(broken.name())
            .iter()
            .find(|p| p.entry_url().is_none())
        {
            return Ok(Observation::Unhealable {
                phase: broken.name().to_string(),
                reason: format!("phase {} has no entry_url to re-drive", missing_entry.name()),
            });
        }
        Ok(observation)
    }

    /// Observe one key and repair it if needed.
    pub async fn reconcile_key(
        &self,
        partition_key: &str,
        correlation_id: &str,
    ) -> Result<KeyOutcome, OrchestratorError> {
        let now = self.clock.now();
        let mut health = self
            .store
            .load_health(partition_key)
            .await?
            .unwrap_or_else(|| KeyHealth::new(partition_key, now));

        let observation = if health.state == HealthState::FailedHeal {
            let observation = self.observe(partition_key).await?;
            match observation.phase() {
                None => return self.recover(health, now).await,
                Some(phase) if health.broken_phase.as_deref() == Some(phase) => {
                    debug!(partition_key, phase, "Key in failed_heal, awaiting operator");
                    return Ok(KeyOutcome::SkippedFailedHeal);
                }
                Some(phase) => {
                    info!(
                        partition_key,
                        phase,
                        previous = health.broken_phase.as_deref().unwrap_or_default(),
                        "Failed key now broken at a different phase, repairing again"
                    );
                    health.restart_repair();
                    observation
                }
            }
        } else {
            if !health.is_due(now) {
                let until = health.next_check_at.unwrap_or(now);
                debug!(partition_key, %until, "Key backing off");
                return Ok(KeyOutcome::BackedOff { until });
            }
            self.observe(partition_key).await?
        };

        let (phase, observed_state) = match observation {
            Observation::Healthy => {
                if health.state == HealthState::Healthy {
                    health.mark_healthy(now);
                    self.store.save_health(&health).await?;
                    return Ok(KeyOutcome::Healthy);
                }
                return self.recover(health, now).await;
            }
            Observation::Pending { phase } => {
                debug!(partition_key, phase = %phase, "Output pending, inside window");
                return Ok(KeyOutcome::Pending { phase });
            }
            Observation::Unhealable { phase, reason } => {
                health.broken_phase = Some(phase.clone());
                health.last_error = Some(reason.clone());
                self.give_up(&mut health, now).await?;
                return Ok(KeyOutcome::FailedHeal { phase, reason });
            }
            Observation::StaleRunning { phase, clear } => {
                warn!(partition_key, phase = %phase, "Upstream stalled, clearing bookkeeping");
                if let Some((record_phase, version)) = clear {
                    match self
                        .store
                        .compare_and_delete(&record_phase, partition_key, version)
                        .await?
                    {
                        CasResult::Success { .. } | CasResult::NotFound => {}
                        CasResult::VersionConflict { actual } => {
                            info!(partition_key, phase = %record_phase, version, actual, "Record moved since observation, skipping");
                            return Ok(KeyOutcome::Contended { phase });
                        }
                    }
                }
                (phase, HealthState::StaleRunning)
            }
            Observation::MissingOutput { phase } => {
                warn!(partition_key, phase = %phase, "Phase triggered but output missing past grace");
                (phase, HealthState::MissingOutput)
            }
        };

        health.broken_phase = Some(phase.clone());
        health.transition(HealthState::Healing, now);
        self.store.save_health(&health).await?;

        match self.heal_chain(&mut health, &phase, correlation_id).await {
            Ok(()) => {
                self.metrics.record_heal(true);
                health.last_error = None;
                health.next_check_at = None;
                health.transition(HealthState::Healing, self.clock.now());
                self.store.save_health(&health).await?;
                info!(partition_key, from_phase = %phase, "Heal chain verified, confirming on next sweep");
                Ok(KeyOutcome::Healed { from_phase: phase })
            }
            Err(reason) => {
                self.metrics.record_heal(false);
                let now = self.clock.now();
                health.heal_attempts += 1;
                health.last_error = Some(reason.clone());

                if health.heal_attempts >= self.config.max_heal_attempts {
                    self.give_up(&mut health, now).await?;
                    return Ok(KeyOutcome::FailedHeal { phase, reason });
                }

                let next_check_at = now + self.backoff(health.heal_attempts);
                health.next_check_at = Some(next_check_at);
                health.transition(observed_state, now);
                self.store.save_health(&health).await?;
                warn!(
                    partition_key,
                    phase = %phase,
                    attempts = health.heal_attempts,
                    %next_check_at,
                    error = %reason,
                    "Heal attempt failed, backing off"
                );
                Ok(KeyOutcome::HealFailed {
                    phase,
                    attempts: health.heal_attempts,
                    next_check_at,
                })
            }
        }
    }

    async fn recover(&self, mut health: KeyHealth, now: DateTime<Utc>) -> Result<KeyOutcome, OrchestratorError> {
        info!(partition_key = %health.partition_key, previous = %health.state, "Key healthy again");
        self.metrics.record_recovery();
        health.mark_healthy(now);
        self.store.save_health(&health).await?;
        Ok(KeyOutcome::Recovered)
    }

    async fn give_up(&self, health: &mut KeyHealth, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        health.next_check_at = None;
        health.transition(HealthState::FailedHeal, now);
        self.store.save_health(health).await?;
        self.alerts
            .failed_heal(&HealAlert {
                partition_key: health.partition_key.clone(),
                broken_phase: health.broken_phase.clone(),
                attempts: health.heal_attempts,
                last_error: health.last_error.clone(),
                raised_at: now,
            })
            .await;
        Ok(())
    }

    /// Trigger `from_phase` and every later phase in order, waiting for each
    /// one's output before moving on.
    async fn heal_chain(
        &self,
        health: &mut KeyHealth,
        from_phase: &str,
        correlation_id: &str,
    ) -> Result<(), String> {
        let partition_key = health.partition_key.clone();
        for phase in self.pipeline.from_phase(from_phase) {
            let request = TriggerRequest {
                partition_key: partition_key.clone(),
                trigger_reason: TriggerReason::SelfHeal,
                missing_processors: Vec::new(),
                correlation_id: correlation_id.to_string(),
                bypass_upstream_check: true,
            };
            let attempted_at = self.clock.now();
            let outcome = self
                .dispatcher
                .trigger_entry(phase.name(), &request, DispatchOrigin::SelfHeal)
                .await
                .map_err(|e| e.to_string())?;
            health.record_heal_dispatch(DispatchAttempt {
                attempted_at,
                target_phase: phase.name().to_string(),
                success: outcome.success,
                status_code: outcome.status_code,
                error: outcome.error.clone(),
                bypass_upstream_check: true,
                origin: DispatchOrigin::SelfHeal,
                correlation_id: correlation_id.to_string(),
            });
            if !outcome.success {
                return Err(format!(
                    "trigger of {} failed: {}",
                    phase.name(),
                    outcome.error.unwrap_or_default()
                ));
            }

            self.await_output(phase.name(), &partition_key).await?;
        }
        Ok(())
    }

    async fn await_output(&self, phase: &str, partition_key: &str) -> Result<(), String> {
        let Some(definition) = self.pipeline.get(phase) else {
            return Err(format!("unknown phase {phase}"));
        };
        let attempts = self.config.artifact_poll_attempts.max(1);
        let interval = std::time::Duration::from_secs(self.config.artifact_poll_interval_secs);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match phase_output_present(self.artifacts.as_ref(), definition, partition_key).await {
                Ok(true) => {
                    debug!(phase, partition_key, attempt, "Phase output verified");
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => last_error = Some(err.to_string()),
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(match last_error {
            Some(err) => format!("output of {phase} not verified after {attempts} checks: {err}"),
            None => format!("output of {phase} did not materialize after {attempts} checks"),
        })
    }

    /// Operator action: forget a key's health so the next sweep starts fresh.
    pub async fn reset_health(&self, partition_key: &str) -> Result<bool, OrchestratorError> {
        let cleared = self.store.clear_health(partition_key).await?;
        info!(partition_key, cleared, "Health reset by operator");
        Ok(cleared)
    }

    pub async fn key_status(&self, partition_key: &str) -> Result<KeyStatus, OrchestratorError> {
        Ok(KeyStatus {
            partition_key: partition_key.to_string(),
            health: self.store.load_health(partition_key).await?,
            records: self.store.list_for_key(partition_key).await?,
        })
    }
}
