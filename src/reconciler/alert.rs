use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// Raised when a key exhausts its heal attempts and needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealAlert {
    pub partition_key: String,
    pub broken_phase: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub raised_at: DateTime<Utc>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn failed_heal(&self, alert: &HealAlert);
}

/// Emits alerts as error-level structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn failed_heal(&self, alert: &HealAlert) {
        error!(
            severity = "critical",
            partition_key = %alert.partition_key,
            broken_phase = alert.broken_phase.as_deref().unwrap_or("unknown"),
            attempts = alert.attempts,
            last_error = alert.last_error.as_deref().unwrap_or_default(),
            "Self-heal gave up on partition key; operator action required"
        );
    }
}
