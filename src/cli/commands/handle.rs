use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

use super::{print_json, with_services, Command};
use crate::config::OrchestratorConfig;
use crate::tracker::TriggerDecision;

pub struct HandleCommand {
    pub phase: String,
    pub event: Option<PathBuf>,
    pub json: bool,
}

impl HandleCommand {
    pub fn new(phase: String, event: Option<PathBuf>) -> Self {
        Self {
            phase,
            event,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    async fn read_event(&self) -> Result<Vec<u8>> {
        match &self.event {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read event file {}", path.display())),
            None => {
                let mut body = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut body)
                    .await
                    .context("Failed to read event from stdin")?;
                Ok(body)
            }
        }
    }
}

impl Command for HandleCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        let body = self.read_event().await?;

        with_services(config, |services| async move {
            let outcome = services.handler.handle_json(&self.phase, &body).await?;
            if self.json {
                return print_json(&outcome);
            }

            println!("📥 {} / {}", outcome.phase, outcome.partition_key);
            match &outcome.decision {
                TriggerDecision::Waiting { completed, expected } => {
                    println!("   ⏳ waiting ({completed}/{expected} processors)");
                }
                TriggerDecision::Trigger(plan) => {
                    println!("   🚀 trigger ({})", plan.reason);
                    if !plan.missing.is_empty() {
                        println!("   ⚠️  missing: {}", plan.missing.join(", "));
                    }
                }
                other => println!("   ↩️  {}", other.label()),
            }
            if let Some(dispatch) = &outcome.dispatch {
                if dispatch.skipped {
                    println!("   ✅ final phase, nothing downstream");
                } else if dispatch.success {
                    println!("   ✅ dispatched (HTTP {})", dispatch.status_code.unwrap_or_default());
                } else {
                    println!(
                        "   ❌ dispatch failed: {}",
                        dispatch.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Ok(())
        })
        .await
    }
}
