use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::observability::OrchestratorMetrics;

/// Graceful shutdown for long-running commands.
pub struct ShutdownCoordinator {
    metrics: Arc<OrchestratorMetrics>,
}

impl ShutdownCoordinator {
    pub fn new(metrics: Arc<OrchestratorMetrics>) -> Self {
        Self { metrics }
    }

    /// Resolves on SIGINT / Ctrl-C.
    pub async fn wait_for_signal(&self) -> Result<()> {
        info!("Shutdown coordinator ready - will stop after the current sweep on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        Ok(())
    }

    /// Flush final counters before the process exits.
    pub fn finish(&self) {
        self.metrics.log_stats();
        crate::telemetry::shutdown_telemetry();
        info!("Graceful shutdown completed");
    }
}
