//! Phase output checks used by self-heal.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;

use crate::error::ArtifactError;
use crate::phase::PhaseDefinition;

pub use memory::InMemoryArtifactChecker;
#[cfg(feature = "database")]
pub use sqlite::SqliteArtifactChecker;

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ArtifactChecker: Send + Sync {
    /// Rows the phase produced for the key.
    async fn row_count(&self, phase: &str, partition_key: &str) -> Result<u64, ArtifactError>;

    /// Whether the phase's output meets its configured minimum.
    async fn exists(&self, phase: &str, partition_key: &str) -> Result<bool, ArtifactError>;
}

/// Phases without an artifact target have nothing to verify and count as present.
pub async fn phase_output_present(
    checker: &dyn ArtifactChecker,
    phase: &PhaseDefinition,
    partition_key: &str,
) -> Result<bool, ArtifactError> {
    if phase.artifact().is_none() {
        return Ok(true);
    }
    checker.exists(phase.name(), partition_key).await
}
