use anyhow::Result;
use serde::Serialize;

use super::{print_json, with_services, Command};
use crate::config::OrchestratorConfig;
use crate::dispatch::DispatchOutcome;
use crate::store::DispatchOrigin;
use crate::tracker::TriggerDecision;

pub struct EvaluateCommand {
    pub phase: String,
    pub key: String,
    pub json: bool,
}

#[derive(Serialize)]
struct EvaluateReport {
    decision: TriggerDecision,
    dispatch: Option<DispatchOutcome>,
}

impl EvaluateCommand {
    pub fn new(phase: String, key: String) -> Self {
        Self {
            phase,
            key,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for EvaluateCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        with_services(config, |services| async move {
            let decision = services.tracker.evaluate_timeout(&self.phase, &self.key).await?;
            let dispatch = match decision.plan() {
                Some(plan) => Some(
                    services
                        .dispatcher
                        .dispatch(plan, DispatchOrigin::TimeoutSweep)
                        .await,
                ),
                None => None,
            };

            let report = EvaluateReport { decision, dispatch };
            if self.json {
                return print_json(&report);
            }
            println!("⏱️  {} / {}: {}", self.phase, self.key, report.decision.label());
            if let Some(dispatch) = &report.dispatch {
                let status = if dispatch.success { "✅ dispatched" } else { "❌ dispatch failed" };
                println!("   {status}");
            }
            Ok(())
        })
        .await
    }
}
