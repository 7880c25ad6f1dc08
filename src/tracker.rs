//! Completion tracker: records processor completions and decides, inside one
//! store transaction, whether the phase should advance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{OrchestratorError, StoreError};
use crate::normalizer::NameResolution;
use crate::observability::OrchestratorMetrics;
use crate::phase::{ExpectedProcessorSet, Pipeline};
use crate::store::{
    transact, CompletionRecord, CompletionStatus, CompletionStore, ProcessorCompletion,
    TransactionRetryPolicy, TriggerReason, TxOutcome,
};
use crate::timeout;

/// Inbound details of one processor completion.
#[derive(Debug, Clone)]
pub struct CompletionPayload {
    pub correlation_id: String,
    pub status: CompletionStatus,
    pub output_table: Option<String>,
    pub record_count: Option<u64>,
}

/// What the dispatcher needs to advance a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerPlan {
    pub phase: String,
    pub partition_key: String,
    pub reason: TriggerReason,
    pub missing: Vec<String>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    /// Name did not resolve to an expected processor; nothing was written.
    Ignored { raw_name: String },
    AlreadyRegistered { processor: String },
    /// `processor` is `None` for timeout evaluations.
    AlreadyTriggered { processor: Option<String> },
    Waiting { completed: usize, expected: usize },
    Trigger(TriggerPlan),
    NoRecord,
}

impl TriggerDecision {
    pub fn plan(&self) -> Option<&TriggerPlan> {
        match self {
            TriggerDecision::Trigger(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TriggerDecision::Ignored { .. } => "ignored",
            TriggerDecision::AlreadyRegistered { .. } => "already_registered",
            TriggerDecision::AlreadyTriggered { .. } => "already_triggered",
            TriggerDecision::Waiting { .. } => "waiting",
            TriggerDecision::Trigger(_) => "trigger",
            TriggerDecision::NoRecord => "no_record",
        }
    }
}

/// Step (g): flip `triggered` when the phase is complete or its window closed.
fn decide(
    record: &mut CompletionRecord,
    expected: &ExpectedProcessorSet,
    now: DateTime<Utc>,
    fallback_correlation: &str,
) -> Option<TriggerPlan> {
    let reason = if record.completed_count >= expected.len() {
        Some((TriggerReason::AllComplete, Vec::new()))
    } else {
        let eval = timeout::evaluate(
            record.first_completion_at,
            now,
            expected.max_wait(),
            record.triggered,
            record.completed_names(),
            expected,
        );
        eval.should_trigger_on_timeout
            .then_some((TriggerReason::Timeout, eval.missing))
    };

    let (reason, missing) = reason?;
    if !record.mark_triggered(reason, missing, now) {
        return None;
    }
    Some(TriggerPlan {
        phase: record.phase.clone(),
        partition_key: record.partition_key.clone(),
        reason,
        missing: record.missing_processors.clone(),
        correlation_id: record
            .correlation_id
            .clone()
            .unwrap_or_else(|| fallback_correlation.to_string()),
    })
}

pub struct CompletionTracker {
    store: Arc<dyn CompletionStore>,
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
    retry: TransactionRetryPolicy,
    metrics: Arc<OrchestratorMetrics>,
}

impl CompletionTracker {
    pub fn new(
        store: Arc<dyn CompletionStore>,
        pipeline: Arc<Pipeline>,
        clock: Arc<dyn Clock>,
        retry: TransactionRetryPolicy,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            pipeline,
            clock,
            retry,
            metrics,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn CompletionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    fn map_store_error(&self, err: StoreError) -> OrchestratorError {
        if matches!(err, StoreError::Contention { .. }) {
            self.metrics.record_contention();
        }
        err.into()
    }

    /// Record one processor completion for `(phase, partition_key)`.
    pub async fn record_completion(
        &self,
        phase: &str,
        partition_key: &str,
        raw_name: &str,
        payload: CompletionPayload,
    ) -> Result<TriggerDecision, OrchestratorError> {
        let definition = self.pipeline.require(phase)?;
        self.metrics.record_event();

        let resolution = definition
            .normalizer()
            .normalize(raw_name, payload.output_table.as_deref());
        let processor = match resolution {
            NameResolution::Rejected { attempted } => {
                self.metrics.record_ignored(raw_name);
                debug!(phase, partition_key, raw_name, attempted = %attempted, "Name rejected");
                return Ok(TriggerDecision::Ignored {
                    raw_name: raw_name.to_string(),
                });
            }
            resolved => resolved.canonical().unwrap_or_default().to_string(),
        };

        let expected = definition.expected();

        let decision = transact(
            self.store.as_ref(),
            &self.retry,
            phase,
            partition_key,
            |mut record| {
                // Each attempt stamps its own commit time.
                let now = self.clock.now();
                if record.contains(&processor) {
                    return TxOutcome::Abort(TriggerDecision::AlreadyRegistered {
                        processor: processor.clone(),
                    });
                }

                record.insert_completion(
                    ProcessorCompletion {
                        processor: processor.clone(),
                        correlation_id: payload.correlation_id.clone(),
                        status: payload.status,
                        completed_at: now,
                        output_rows: payload.record_count,
                    },
                    now,
                );

                if record.triggered {
                    return TxOutcome::Commit(
                        record,
                        TriggerDecision::AlreadyTriggered {
                            processor: Some(processor.clone()),
                        },
                    );
                }

                let decision = match decide(&mut record, expected, now, &payload.correlation_id) {
                    Some(plan) => TriggerDecision::Trigger(plan),
                    None => TriggerDecision::Waiting {
                        completed: record.completed_count,
                        expected: expected.len(),
                    },
                };
                TxOutcome::Commit(record, decision)
            },
        )
        .await
        .map_err(|err| self.map_store_error(err))?;

        match &decision {
            TriggerDecision::AlreadyRegistered { .. } => {
                self.metrics.record_duplicate();
                debug!(phase, partition_key, processor = %processor, "Duplicate completion");
            }
            TriggerDecision::Trigger(plan) => {
                self.metrics
                    .record_trigger(plan.reason == TriggerReason::Timeout);
                info!(
                    phase,
                    partition_key,
                    processor = %processor,
                    reason = %plan.reason,
                    missing = ?plan.missing,
                    "Phase ready to advance"
                );
            }
            other => {
                debug!(phase, partition_key, processor = %processor, decision = other.label(), "Completion recorded");
            }
        }
        Ok(decision)
    }

    /// Re-run the trigger condition without a new completion.
    pub async fn evaluate_timeout(
        &self,
        phase: &str,
        partition_key: &str,
    ) -> Result<TriggerDecision, OrchestratorError> {
        let definition = self.pipeline.require(phase)?;
        let expected = definition.expected();

        let decision = transact(
            self.store.as_ref(),
            &self.retry,
            phase,
            partition_key,
            |mut record| {
                let now = self.clock.now();
                if !record.is_persisted() {
                    return TxOutcome::Abort(TriggerDecision::NoRecord);
                }
                if record.triggered {
                    return TxOutcome::Abort(TriggerDecision::AlreadyTriggered { processor: None });
                }
                match decide(&mut record, expected, now, "") {
                    Some(plan) => TxOutcome::Commit(record, TriggerDecision::Trigger(plan)),
                    None => TxOutcome::Abort(TriggerDecision::Waiting {
                        completed: record.completed_count,
                        expected: expected.len(),
                    }),
                }
            },
        )
        .await
        .map_err(|err| self.map_store_error(err))?;

        if let TriggerDecision::Trigger(plan) = &decision {
            self.metrics
                .record_trigger(plan.reason == TriggerReason::Timeout);
            info!(
                phase,
                partition_key,
                reason = %plan.reason,
                missing = ?plan.missing,
                "Phase advanced on re-evaluation"
            );
        }
        Ok(decision)
    }
}
