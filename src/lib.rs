// Phase Orchestrator - completion tracking, exactly-once phase triggers and self-heal
// This exposes the core components for the CLI, tests and embedding services

pub mod artifacts;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod health;
pub mod normalizer;
pub mod observability;
pub mod phase;
pub mod reconciler;
pub mod runtime;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod timeout;
pub mod tracker;

// Re-export key types for easy access
pub use artifacts::{ArtifactChecker, InMemoryArtifactChecker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use dispatch::{CredentialProvider, DispatchOutcome, TriggerDispatcher, TriggerRequest};
pub use error::{OrchestratorError, Result};
pub use handler::{CompletionEvent, CompletionHandler, HandlerOutcome};
pub use health::{HealthState, KeyHealth};
pub use normalizer::{NameNormalizer, NameResolution};
pub use observability::{OperationTimer, OrchestratorMetrics};
pub use phase::{ExpectedProcessorSet, PhaseDefinition, Pipeline};
pub use reconciler::{AlertSink, KeyOutcome, SelfHealReconciler, SweepReport};
pub use runtime::{Collaborators, OrchestratorServices};
pub use shutdown::ShutdownCoordinator;
pub use store::{
    CompletionRecord, CompletionStatus, CompletionStore, InMemoryCompletionStore, TriggerReason,
};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use tracker::{CompletionTracker, TriggerDecision, TriggerPlan};
