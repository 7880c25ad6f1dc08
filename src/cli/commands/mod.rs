use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::runtime::OrchestratorServices;

pub mod config;
pub mod evaluate;
pub mod handle;
pub mod reset;
pub mod status;
pub mod sweep;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self, config: &OrchestratorConfig) -> Result<()>;
}

pub async fn with_services<F, Fut, R>(config: &OrchestratorConfig, f: F) -> Result<R>
where
    F: FnOnce(OrchestratorServices) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let services = OrchestratorServices::from_config(config)
        .await
        .context("Failed to initialize orchestrator services")?;
    f(services).await
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
