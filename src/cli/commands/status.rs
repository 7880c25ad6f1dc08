use anyhow::Result;

use super::{print_json, with_services, Command};
use crate::config::OrchestratorConfig;

pub struct StatusCommand {
    pub key: String,
    pub json: bool,
}

impl StatusCommand {
    pub fn new(key: String) -> Self {
        Self { key, json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for StatusCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        with_services(config, |services| async move {
            let status = services.reconciler.key_status(&self.key).await?;
            if self.json {
                return print_json(&status);
            }

            println!("📊 PARTITION {}", status.partition_key);
            println!("==========================");
            match &status.health {
                Some(health) => {
                    println!("🩺 health: {} (attempts {})", health.state, health.heal_attempts);
                    if let Some(phase) = &health.broken_phase {
                        println!("   broken phase: {phase}");
                    }
                    if let Some(at) = health.next_check_at {
                        println!("   next check: {at}");
                    }
                    if let Some(err) = &health.last_error {
                        println!("   last error: {err}");
                    }
                    for attempt in &health.heal_dispatches {
                        let mark = if attempt.success { "🔧" } else { "❌" };
                        println!(
                            "   {mark} {} → {} self-heal{}",
                            attempt.attempted_at,
                            attempt.target_phase,
                            attempt
                                .error
                                .as_deref()
                                .map(|e| format!(": {e}"))
                                .unwrap_or_default()
                        );
                    }
                }
                None => println!("🩺 health: not yet observed"),
            }
            println!();

            if status.records.is_empty() {
                println!("No completion records.");
                return Ok(());
            }

            for record in &status.records {
                let expected = services
                    .pipeline
                    .get(&record.phase)
                    .map(|p| p.expected().len())
                    .unwrap_or_default();
                let flag = if record.triggered { "🚀" } else { "⏳" };
                println!(
                    "{flag} {} ({}/{}) v{}",
                    record.phase, record.completed_count, expected, record.version
                );
                if let Some(reason) = record.trigger_reason {
                    println!("   reason: {reason}");
                }
                if !record.missing_processors.is_empty() {
                    println!("   missing: {}", record.missing_processors.join(", "));
                }
                for attempt in &record.dispatches {
                    let mark = if attempt.success { "✅" } else { "❌" };
                    println!(
                        "   {mark} {} → {} {:?}{}",
                        attempt.attempted_at,
                        attempt.target_phase,
                        attempt.origin,
                        attempt
                            .error
                            .as_deref()
                            .map(|e| format!(": {e}"))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(())
        })
        .await
    }
}
