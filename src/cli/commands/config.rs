use anyhow::Result;

use super::Command;
use crate::config::OrchestratorConfig;

/// Prints the merged configuration after validation.
pub struct ConfigCommand;

impl Command for ConfigCommand {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()> {
        config.validate()?;
        print!("{}", config.to_toml()?);
        Ok(())
    }
}
