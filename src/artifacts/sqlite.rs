use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::ArtifactChecker;
use crate::error::ArtifactError;
use crate::phase::{ArtifactTarget, Pipeline};

/// Counts rows per partition key in each phase's configured output table.
#[derive(Debug, Clone)]
pub struct SqliteArtifactChecker {
    pool: SqlitePool,
    targets: HashMap<String, ArtifactTarget>,
    query_timeout: Duration,
}

impl SqliteArtifactChecker {
    pub async fn connect(url: &str, pipeline: &Pipeline, query_timeout: Duration) -> Result<Self, ArtifactError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(|e| ArtifactError::Query(e.to_string()))?;
        Ok(Self::from_pool(pool, pipeline, query_timeout))
    }

    pub fn from_pool(pool: SqlitePool, pipeline: &Pipeline, query_timeout: Duration) -> Self {
        let targets = pipeline
            .phases()
            .iter()
            .filter_map(|p| p.artifact().map(|t| (p.name().to_string(), t.clone())))
            .collect();
        Self {
            pool,
            targets,
            query_timeout,
        }
    }

    fn target(&self, phase: &str) -> Result<&ArtifactTarget, ArtifactError> {
        self.targets
            .get(phase)
            .ok_or_else(|| ArtifactError::NotConfigured(phase.to_string()))
    }
}

/// Quote each part of a possibly schema-qualified name: `main.t` -> `"main"."t"`.
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

#[async_trait]
impl ArtifactChecker for SqliteArtifactChecker {
    async fn row_count(&self, phase: &str, partition_key: &str) -> Result<u64, ArtifactError> {
        let target = self.target(phase)?;
        // Identifiers are validated against SQL_IDENTIFIER when config loads.
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE {} = ?1",
            quote_identifier(&target.table),
            quote_identifier(&target.key_column)
        );

        let query = sqlx::query(&sql).bind(partition_key).fetch_one(&self.pool);
        let row = tokio::time::timeout(self.query_timeout, query)
            .await
            .map_err(|_| ArtifactError::Timeout {
                phase: phase.to_string(),
                partition_key: partition_key.to_string(),
                timeout_ms: self.query_timeout.as_millis() as u64,
            })?
            .map_err(|e| ArtifactError::Query(e.to_string()))?;

        let count = row.get::<i64, _>("n").max(0) as u64;
        debug!(phase, partition_key, table = %target.table, count, "Artifact row count");
        Ok(count)
    }

    async fn exists(&self, phase: &str, partition_key: &str) -> Result<bool, ArtifactError> {
        let min_rows = self.target(phase)?.min_rows;
        Ok(self.row_count(phase, partition_key).await? >= min_rows)
    }
}
