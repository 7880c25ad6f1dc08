use thiserror::Error;

/// Errors raised by the completion store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction on {phase}/{partition_key} still contended after {attempts} attempts")]
    Contention {
        phase: String,
        partition_key: String,
        attempts: usize,
    },

    #[error("version conflict on {phase}/{partition_key}: expected {expected}, found {actual}")]
    VersionConflict {
        phase: String,
        partition_key: String,
        expected: u64,
        actual: u64,
    },

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store lock poisoned")]
    Poisoned,
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Backend(format!("migration failed: {err}"))
    }
}

/// Errors raised while calling a downstream entry point.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("credential acquisition for {audience} failed: {reason}")]
    Credential { audience: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid entry point URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Errors raised by the artifact existence checks.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact check for {phase}/{partition_key} timed out after {timeout_ms}ms")]
    Timeout {
        phase: String,
        partition_key: String,
        timeout_ms: u64,
    },

    #[error("no artifact target configured for phase {0}")]
    NotConfigured(String),

    #[error("artifact query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Crate-level error returned by handlers, tracker and reconciler.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("invalid completion event: {0}")]
    InvalidEvent(String),
}

impl OrchestratorError {
    /// Whether redelivering the same event could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Store(StoreError::Contention { .. })
                | OrchestratorError::Store(StoreError::Backend(_))
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_retryable_but_bad_events_are_not() {
        let contention: OrchestratorError = StoreError::Contention {
            phase: "analytics".to_string(),
            partition_key: "2024-03-01".to_string(),
            attempts: 5,
        }
        .into();
        assert!(contention.is_retryable());
        assert!(contention.to_string().contains("analytics/2024-03-01"));

        let invalid = OrchestratorError::InvalidEvent("missing partition_key".to_string());
        assert!(!invalid.is_retryable());
    }
}
