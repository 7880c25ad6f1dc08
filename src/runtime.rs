// Wires the configured collaborators into one set of shared services.

use std::sync::Arc;
use tracing::info;

use crate::artifacts::{ArtifactChecker, InMemoryArtifactChecker};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::dispatch::{credentials, CredentialProvider, TriggerDispatcher};
use crate::error::{ConfigError, OrchestratorError};
use crate::handler::CompletionHandler;
use crate::observability::OrchestratorMetrics;
use crate::phase::Pipeline;
use crate::reconciler::{AlertSink, LogAlertSink, SelfHealReconciler};
use crate::store::{CompletionStore, InMemoryCompletionStore, TransactionRetryPolicy};
use crate::tracker::CompletionTracker;

pub const MEMORY_STORE_URL: &str = "memory";

pub struct OrchestratorServices {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn CompletionStore>,
    pub tracker: Arc<CompletionTracker>,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub handler: CompletionHandler,
    pub reconciler: SelfHealReconciler,
    pub metrics: Arc<OrchestratorMetrics>,
}

/// Injected boundaries. Anything left `None` is built from configuration.
#[derive(Default)]
pub struct Collaborators {
    pub store: Option<Arc<dyn CompletionStore>>,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub artifacts: Option<Arc<dyn ArtifactChecker>>,
    pub alerts: Option<Arc<dyn AlertSink>>,
    pub clock: Option<Arc<dyn Clock>>,
}

async fn open_store(config: &OrchestratorConfig) -> Result<Arc<dyn CompletionStore>, OrchestratorError> {
    if config.store.url == MEMORY_STORE_URL {
        info!("Using in-memory completion store");
        return Ok(Arc::new(InMemoryCompletionStore::new()));
    }

    open_sqlite_store(config).await
}

#[cfg(feature = "database")]
async fn open_sqlite_store(config: &OrchestratorConfig) -> Result<Arc<dyn CompletionStore>, OrchestratorError> {
    let store = crate::store::SqliteCompletionStore::connect(&config.store).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "database"))]
async fn open_sqlite_store(config: &OrchestratorConfig) -> Result<Arc<dyn CompletionStore>, OrchestratorError> {
    Err(ConfigError::Invalid(format!(
        "store url {} requires the `database` feature",
        config.store.url
    ))
    .into())
}

async fn open_artifacts(
    config: &OrchestratorConfig,
    pipeline: &Pipeline,
) -> Result<Arc<dyn ArtifactChecker>, OrchestratorError> {
    let needs_checker = pipeline.phases().iter().any(|p| p.artifact().is_some());
    match &config.artifacts.url {
        None if needs_checker => Err(ConfigError::Invalid(
            "artifacts.url is required when a phase declares artifact_table".into(),
        )
        .into()),
        None => Ok(Arc::new(InMemoryArtifactChecker::new())),
        #[cfg(feature = "database")]
        Some(url) => {
            let checker = crate::artifacts::SqliteArtifactChecker::connect(
                url,
                pipeline,
                std::time::Duration::from_secs(config.artifacts.query_timeout_secs),
            )
            .await?;
            Ok(Arc::new(checker))
        }
        #[cfg(not(feature = "database"))]
        Some(url) => Err(ConfigError::Invalid(format!(
            "artifacts url {url} requires the `database` feature"
        ))
        .into()),
    }
}

impl OrchestratorServices {
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::build(config, Collaborators::default()).await
    }

    pub async fn build(
        config: &OrchestratorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let pipeline = Arc::new(Pipeline::from_config(&config.phases)?);

        let store = match collaborators.store {
            Some(store) => store,
            None => open_store(config).await?,
        };
        let credentials = match collaborators.credentials {
            Some(credentials) => credentials,
            None => credentials::from_config(&config.dispatch)?,
        };
        let artifacts = match collaborators.artifacts {
            Some(artifacts) => artifacts,
            None => open_artifacts(config, &pipeline).await?,
        };
        let alerts = collaborators
            .alerts
            .unwrap_or_else(|| Arc::new(LogAlertSink));
        let clock = collaborators
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = Arc::new(OrchestratorMetrics::new());

        let tracker = Arc::new(CompletionTracker::new(
            store.clone(),
            pipeline.clone(),
            clock.clone(),
            TransactionRetryPolicy::from(&config.store.retry),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            &config.dispatch,
            pipeline.clone(),
            credentials,
            store.clone(),
            clock.clone(),
            metrics.clone(),
        )?);
        let handler = CompletionHandler::new(tracker.clone(), dispatcher.clone());
        let reconciler = SelfHealReconciler::new(
            store.clone(),
            pipeline.clone(),
            tracker.clone(),
            dispatcher.clone(),
            artifacts,
            alerts,
            clock,
            config.reconciler.clone(),
            metrics.clone(),
        );

        info!(phases = pipeline.phases().len(), "Orchestrator services ready");
        Ok(Self {
            pipeline,
            store,
            tracker,
            dispatcher,
            handler,
            reconciler,
            metrics,
        })
    }
}
