use anyhow::{Context, Result};
use clap::Parser;

use phase_orchestrator::cli::commands::config::ConfigCommand;
use phase_orchestrator::cli::commands::evaluate::EvaluateCommand;
use phase_orchestrator::cli::commands::handle::HandleCommand;
use phase_orchestrator::cli::commands::reset::ResetHealthCommand;
use phase_orchestrator::cli::commands::status::StatusCommand;
use phase_orchestrator::cli::commands::sweep::SweepCommand;
use phase_orchestrator::cli::commands::Command;
use phase_orchestrator::cli::{Cli, Commands};
use phase_orchestrator::{init_telemetry, OrchestratorConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    OrchestratorConfig::load_env_file()?;
    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_telemetry(&config.observability)?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Handle { phase, event } => runtime.block_on(async {
            HandleCommand::new(phase, event)
                .with_json(cli.json)
                .execute(&config)
                .await
        }),
        Commands::Evaluate { phase, key } => runtime.block_on(async {
            EvaluateCommand::new(phase, key)
                .with_json(cli.json)
                .execute(&config)
                .await
        }),
        Commands::Sweep { keys, watch } => runtime.block_on(async {
            SweepCommand::new(keys, watch)
                .with_json(cli.json)
                .execute(&config)
                .await
        }),
        Commands::Status { key } => runtime.block_on(async {
            StatusCommand::new(key)
                .with_json(cli.json)
                .execute(&config)
                .await
        }),
        Commands::ResetHealth { key } => {
            runtime.block_on(async { ResetHealthCommand::new(key).execute(&config).await })
        }
        Commands::Config => runtime.block_on(async { ConfigCommand.execute(&config).await }),
    }
}
