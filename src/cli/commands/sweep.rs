use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};

use super::{print_json, with_services, Command};
use crate::config::OrchestratorConfig;
use crate::reconciler::{KeyOutcome, SweepReport};
use crate::shutdown::ShutdownCoordinator;

pub struct SweepCommand {
    pub keys: Vec<String>,
    pub watch: bool,
    pub json: bool,
}

impl SweepCommand {
    pub fn new(keys: Vec<String>, watch: bool) -> Self {
        Self {
            keys,
            watch,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn print_report(&self, report: &SweepReport) -> Result<()> {
        if self.json {
            return print_json(report);
        }
        println!("🩺 Sweep {} at {}", report.sweep_id, report.started_at);
        println!("   ⏱️  timeout triggers: {}", report.timeout_triggers.len());
        for key in &report.keys {
            let line = match &key.outcome {
                KeyOutcome::Healthy => "🟢 healthy".to_string(),
                KeyOutcome::Recovered => "🟢 recovered".to_string(),
                KeyOutcome::Pending { phase } => format!("⏳ pending ({phase})"),
                KeyOutcome::BackedOff { until } => format!("💤 backing off until {until}"),
                KeyOutcome::SkippedFailedHeal => "🔴 failed_heal (needs reset-health)".to_string(),
                KeyOutcome::Contended { phase } => format!("↩️  {phase} changed, retry next sweep"),
                KeyOutcome::Healed { from_phase } => format!("🔧 healed from {from_phase}"),
                KeyOutcome::HealFailed { phase, attempts, .. } => {
                    format!("🟠 heal of {phase} failed (attempt {attempts})")
                }
                KeyOutcome::FailedHeal { phase, reason } => format!("🔴 gave up on {phase}: {reason}"),
            };
            println!("   {}: {}", key.partition_key, line);
        }
        if report.archived > 0 {
            println!("   🗄️  archived {} records", report.archived);
        }
        for err in &report.errors {
            println!("   ❌ {}: {}", err.partition_key, err.message);
        }
        Ok(())
    }
}

impl Command for SweepCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        let interval = Duration::from_secs(config.reconciler.sweep_interval_secs.max(1));

        with_services(config, |services| async move {
            if !self.watch {
                let report = services.reconciler.sweep(&self.keys).await?;
                return self.print_report(&report);
            }

            let coordinator = ShutdownCoordinator::new(services.metrics.clone());
            let shutdown = coordinator.wait_for_signal();
            tokio::pin!(shutdown);
            let mut ticker = tokio::time::interval(interval);
            info!(interval_secs = interval.as_secs(), "Watching: sweeping on interval");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match services.reconciler.sweep(&self.keys).await {
                            Ok(report) => self.print_report(&report)?,
                            Err(err) => error!(error = %err, "Sweep failed"),
                        }
                    }
                    result = &mut shutdown => {
                        result?;
                        break;
                    }
                }
            }

            coordinator.finish();
            Ok(())
        })
        .await
    }
}
