//! Trigger dispatcher: one authenticated POST to the next phase's entry point.
//!
//! Dispatch is never retried inline. A failed call is logged, counted and
//! appended to the upstream record's audit trail; the self-heal sweep picks the
//! key up once its grace period has passed.

pub mod credentials;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, OrchestratorError};
use crate::observability::OrchestratorMetrics;
use crate::phase::{PhaseDefinition, Pipeline};
use crate::store::{CompletionStore, DispatchAttempt, DispatchOrigin, TriggerReason};
use crate::tracker::TriggerPlan;

pub use credentials::{
    AnonymousCredentials, CredentialProvider, MetadataServerCredentials, StaticTokenCredentials,
};

const ERROR_SNIPPET_CHARS: usize = 512;

/// Body POSTed to a phase entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub partition_key: String,
    pub trigger_reason: TriggerReason,
    pub missing_processors: Vec<String>,
    pub correlation_id: String,
    pub bypass_upstream_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Set when the phase has no downstream; nothing was sent.
    pub skipped: bool,
    pub target_phase: Option<String>,
}

impl DispatchOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            status_code: None,
            error: None,
            skipped: true,
            target_phase: None,
        }
    }

    fn failed(target_phase: &str, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error: Some(error.into()),
            skipped: false,
            target_phase: Some(target_phase.to_string()),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= ERROR_SNIPPET_CHARS {
        return text.to_string();
    }
    let mut snippet: String = text.chars().take(ERROR_SNIPPET_CHARS).collect();
    snippet.push_str("...");
    snippet
}

/// Token audience for an entry point: its scheme, host and port.
fn audience_for(url: &str) -> Result<String, DispatchError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| DispatchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| DispatchError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

pub struct TriggerDispatcher {
    client: reqwest::Client,
    pipeline: Arc<Pipeline>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn CompletionStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<OrchestratorMetrics>,
}

impl TriggerDispatcher {
    pub fn new(
        config: &DispatchConfig,
        pipeline: Arc<Pipeline>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn CompletionStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            pipeline,
            credentials,
            store,
            clock,
            metrics,
        })
    }

    /// Fire the phase after `plan.phase` for the plan's key.
    pub async fn dispatch(&self, plan: &TriggerPlan, origin: DispatchOrigin) -> DispatchOutcome {
        let Some(target) = self.pipeline.next_after(&plan.phase) else {
            info!(
                phase = %plan.phase,
                partition_key = %plan.partition_key,
                "Final phase complete, no downstream to trigger"
            );
            return DispatchOutcome::skipped();
        };

        let request = TriggerRequest {
            partition_key: plan.partition_key.clone(),
            trigger_reason: plan.reason,
            missing_processors: plan.missing.clone(),
            correlation_id: plan.correlation_id.clone(),
            bypass_upstream_check: false,
        };
        self.send(target, Some(&plan.phase), &request, origin).await
    }

    /// Fire `target_phase`'s entry point directly. Used by self-heal re-drives.
    pub async fn trigger_entry(
        &self,
        target_phase: &str,
        request: &TriggerRequest,
        origin: DispatchOrigin,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let target = self.pipeline.require(target_phase)?;
        let upstream = self.pipeline.previous(target_phase).map(PhaseDefinition::name);
        Ok(self.send(target, upstream, request, origin).await)
    }

    async fn send(
        &self,
        target: &PhaseDefinition,
        audit_phase: Option<&str>,
        request: &TriggerRequest,
        origin: DispatchOrigin,
    ) -> DispatchOutcome {
        let attempted_at = self.clock.now();
        let outcome = match target.entry_url() {
            Some(url) => self.post(target.name(), url, request).await,
            None => DispatchOutcome::failed(target.name(), None, "no entry_url configured"),
        };

        self.metrics.record_dispatch(outcome.success);
        if outcome.success {
            info!(
                target_phase = target.name(),
                partition_key = %request.partition_key,
                correlation_id = %request.correlation_id,
                reason = %request.trigger_reason,
                status = ?outcome.status_code,
                bypass = request.bypass_upstream_check,
                "Triggered downstream phase"
            );
        } else {
            warn!(
                target_phase = target.name(),
                partition_key = %request.partition_key,
                correlation_id = %request.correlation_id,
                status = ?outcome.status_code,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Downstream trigger failed"
            );
        }

        if let Some(phase) = audit_phase {
            self.audit(phase, request, &outcome, origin, attempted_at).await;
        }
        outcome
    }

    async fn post(&self, target_phase: &str, url: &str, request: &TriggerRequest) -> DispatchOutcome {
        let token = match audience_for(url) {
            Ok(audience) => self.credentials.get_token(&audience).await,
            Err(err) => Err(err),
        };
        let token = match token {
            Ok(token) => token,
            Err(err) => return DispatchOutcome::failed(target_phase, None, err.to_string()),
        };

        let mut builder = self.client.post(url).json(request);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let err = DispatchError::from(err);
                return DispatchOutcome::failed(target_phase, None, truncate(&err.to_string()));
            }
        };

        let status = response.status();
        if status.is_success() {
            return DispatchOutcome {
                success: true,
                status_code: Some(status.as_u16()),
                error: None,
                skipped: false,
                target_phase: Some(target_phase.to_string()),
            };
        }

        let body = response.text().await.unwrap_or_default();
        DispatchOutcome::failed(
            target_phase,
            Some(status.as_u16()),
            truncate(&format!("HTTP {status}: {body}")),
        )
    }

    async fn audit(
        &self,
        phase: &str,
        request: &TriggerRequest,
        outcome: &DispatchOutcome,
        origin: DispatchOrigin,
        attempted_at: DateTime<Utc>,
    ) {
        let attempt = DispatchAttempt {
            attempted_at,
            target_phase: outcome.target_phase.clone().unwrap_or_default(),
            success: outcome.success,
            status_code: outcome.status_code,
            error: outcome.error.clone(),
            bypass_upstream_check: request.bypass_upstream_check,
            origin,
            correlation_id: request.correlation_id.clone(),
        };
        if let Err(err) = self
            .store
            .record_dispatch(phase, &request.partition_key, attempt)
            .await
        {
            warn!(phase, partition_key = %request.partition_key, error = %err, "Failed to record dispatch outcome");
        }
    }
}
