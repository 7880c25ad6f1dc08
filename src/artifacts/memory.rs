use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::ArtifactChecker;
use crate::error::ArtifactError;

/// Row counts held in memory. Tests and dry runs write them directly.
#[derive(Debug)]
pub struct InMemoryArtifactChecker {
    rows: RwLock<HashMap<(String, String), u64>>,
    min_rows: u64,
}

impl Default for InMemoryArtifactChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArtifactChecker {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            min_rows: 1,
        }
    }

    pub fn with_min_rows(mut self, min_rows: u64) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn set_rows(&self, phase: &str, partition_key: &str, rows: u64) {
        let mut guard = self.rows.write().unwrap_or_else(|p| p.into_inner());
        guard.insert((phase.to_string(), partition_key.to_string()), rows);
    }

    pub fn clear(&self, phase: &str, partition_key: &str) {
        let mut guard = self.rows.write().unwrap_or_else(|p| p.into_inner());
        guard.remove(&(phase.to_string(), partition_key.to_string()));
    }
}

#[async_trait]
impl ArtifactChecker for InMemoryArtifactChecker {
    async fn row_count(&self, phase: &str, partition_key: &str) -> Result<u64, ArtifactError> {
        let guard = self.rows.read().unwrap_or_else(|p| p.into_inner());
        Ok(guard
            .get(&(phase.to_string(), partition_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn exists(&self, phase: &str, partition_key: &str) -> Result<bool, ArtifactError> {
        Ok(self.row_count(phase, partition_key).await? >= self.min_rows)
    }
}
