use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{warn, Instrument};

use crate::dispatch::{DispatchOutcome, TriggerDispatcher};
use crate::error::OrchestratorError;
use crate::observability::OperationTimer;
use crate::store::{CompletionStatus, DispatchOrigin};
use crate::telemetry::{completion_span, generate_correlation_id};
use crate::tracker::{CompletionPayload, CompletionTracker, TriggerDecision};

/// Inbound completion event as published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub partition_key: String,
    pub processor_name: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub output_table: Option<String>,
    #[serde(default)]
    pub record_count: Option<u64>,
}

impl CompletionEvent {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.partition_key.trim().is_empty() {
            return Err(OrchestratorError::InvalidEvent("partition_key is empty".into()));
        }
        if self.processor_name.trim().is_empty() {
            return Err(OrchestratorError::InvalidEvent("processor_name is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerOutcome {
    pub phase: String,
    pub partition_key: String,
    pub correlation_id: String,
    pub decision: TriggerDecision,
    pub dispatch: Option<DispatchOutcome>,
}

/// Entry point for one completion event: track, then dispatch on `Trigger`.
pub struct CompletionHandler {
    tracker: Arc<CompletionTracker>,
    dispatcher: Arc<TriggerDispatcher>,
}

impl CompletionHandler {
    pub fn new(tracker: Arc<CompletionTracker>, dispatcher: Arc<TriggerDispatcher>) -> Self {
        Self {
            tracker,
            dispatcher,
        }
    }

    pub async fn handle(
        &self,
        phase: &str,
        event: CompletionEvent,
    ) -> Result<HandlerOutcome, OrchestratorError> {
        event.validate()?;
        let correlation_id = event
            .correlation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_correlation_id);
        let span = completion_span(phase, &event.partition_key, &correlation_id);

        async move {
            let payload = CompletionPayload {
                correlation_id: correlation_id.clone(),
                status: event.status,
                output_table: event.output_table.clone(),
                record_count: event.record_count,
            };
            if event.status == CompletionStatus::Error {
                warn!(processor = %event.processor_name, "Processor reported an error status");
            }

            let timer = OperationTimer::new("record_completion");
            let decision = self
                .tracker
                .record_completion(phase, &event.partition_key, &event.processor_name, payload)
                .await
                .inspect_err(|err| {
                    warn!(error = %err, retryable = err.is_retryable(), "Completion not recorded");
                })?;
            timer.finish();

            let dispatch = match decision.plan() {
                Some(plan) => Some(self.dispatcher.dispatch(plan, DispatchOrigin::Tracker).await),
                None => None,
            };

            Ok(HandlerOutcome {
                phase: phase.to_string(),
                partition_key: event.partition_key,
                correlation_id,
                decision,
                dispatch,
            })
        }
        .instrument(span)
        .await
    }

    /// Decode and handle a raw JSON event body.
    pub async fn handle_json(&self, phase: &str, body: &[u8]) -> Result<HandlerOutcome, OrchestratorError> {
        let event: CompletionEvent = serde_json::from_slice(body)
            .map_err(|e| OrchestratorError::InvalidEvent(e.to_string()))?;
        self.handle(phase, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_decodes_with_optional_fields_absent() {
        let event: CompletionEvent = serde_json::from_str(
            r#"{"partition_key":"2024-03-01","processor_name":"AlphaProcessor","status":"success"}"#,
        )
        .unwrap();
        assert_eq!(event.status, CompletionStatus::Success);
        assert!(event.correlation_id.is_none() && event.output_table.is_none());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn blank_identity_fields_are_invalid() {
        let event = CompletionEvent {
            partition_key: " ".into(),
            processor_name: "alpha".into(),
            status: CompletionStatus::Error,
            correlation_id: None,
            output_table: None,
            record_count: None,
        };
        assert!(matches!(event.validate(), Err(OrchestratorError::InvalidEvent(_))));
    }

    #[test]
    fn unknown_status_is_rejected_by_decoding() {
        let result = serde_json::from_str::<CompletionEvent>(
            r#"{"partition_key":"k","processor_name":"alpha","status":"partial"}"#,
        );
        assert!(result.is_err());
    }
}
