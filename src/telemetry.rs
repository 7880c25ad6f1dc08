use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    tracing::debug!("Phase orchestrator telemetry initialized");
    Ok(())
}

pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping the handling of one completion event.
pub fn completion_span(phase: &str, partition_key: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "completion",
        phase = phase,
        partition.key = partition_key,
        correlation.id = correlation_id,
    )
}

pub fn sweep_span(sweep_id: &str) -> tracing::Span {
    tracing::info_span!("self_heal_sweep", sweep.id = sweep_id)
}

pub fn shutdown_telemetry() {
    tracing::debug!("Phase orchestrator telemetry shutdown complete");
}
