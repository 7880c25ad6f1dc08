use anyhow::Result;

use super::{with_services, Command};
use crate::config::OrchestratorConfig;

pub struct ResetHealthCommand {
    pub key: String,
}

impl ResetHealthCommand {
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl Command for ResetHealthCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        with_services(config, |services| async move {
            if services.reconciler.reset_health(&self.key).await? {
                println!("🔄 Cleared self-heal state for {}", self.key);
            } else {
                println!("ℹ️  No self-heal state recorded for {}", self.key);
            }
            Ok::<(), anyhow::Error>(())
        })
        .await
    }
}
