use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{CasResult, CompletionRecord, CompletionStore, DispatchAttempt};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::health::KeyHealth;

/// SQLite-backed completion store. Versioned `UPDATE ... WHERE version = ?`
/// gives the compare-and-swap semantics.
#[derive(Debug, Clone)]
pub struct SqliteCompletionStore {
    pool: SqlitePool,
}

/// Fixed-width UTC timestamps so that text comparison matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteCompletionStore {
    /// Open (creating if needed) the database and optionally run migrations.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.url.as_str();
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            info!("Creating completion store at {}", url);
            Sqlite::create_database(url).await?;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        if config.auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running completion store migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Completion store migrations completed");
        Ok(())
    }


    async fn current_version(&self, phase: &str, partition_key: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(
            "SELECT version FROM completion_records WHERE phase = ?1 AND partition_key = ?2",
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get::<i64, _>("version") as u64))
    }

    async fn dispatches(&self, phase: &str, partition_key: &str) -> Result<Vec<DispatchAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM dispatch_attempts
            WHERE phase = ?1 AND partition_key = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            attempts.push(serde_json::from_str(row.get::<&str, _>("body"))?);
        }
        Ok(attempts)
    }

    async fn hydrate(&self, body: &str, version: i64) -> Result<CompletionRecord, StoreError> {
        let mut record: CompletionRecord = serde_json::from_str(body)?;
        record.version = version as u64;
        record.dispatches = self
            .dispatches(&record.phase, &record.partition_key)
            .await?;
        Ok(record)
    }

    /// Body JSON without the dispatch audit, which lives in its own table.
    fn encode(record: &CompletionRecord, version: u64) -> Result<String, StoreError> {
        let mut stored = record.clone();
        stored.version = version;
        stored.dispatches.clear();
        Ok(serde_json::to_string(&stored)?)
    }

    /// Copy a live record (with its audit) to the archive table and remove it.
    async fn archive_in(
        tx: &mut Transaction<'_, Sqlite>,
        phase: &str,
        partition_key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT version, body FROM completion_records WHERE phase = ?1 AND partition_key = ?2",
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        let version: i64 = row.get("version");
        let mut record: CompletionRecord = serde_json::from_str(row.get::<&str, _>("body"))?;
        let audit = sqlx::query(
            "SELECT body FROM dispatch_attempts WHERE phase = ?1 AND partition_key = ?2 ORDER BY id ASC",
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_all(&mut **tx)
        .await?;
        record.dispatches = audit
            .iter()
            .map(|r| serde_json::from_str(r.get::<&str, _>("body")))
            .collect::<Result<_, _>>()?;

        sqlx::query(
            r#"
            INSERT INTO completion_records_archive (phase, partition_key, version, body, archived_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(phase)
        .bind(partition_key)
        .bind(version)
        .bind(serde_json::to_string(&record)?)
        .bind(timestamp(now))
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO retired_record_versions (phase, partition_key, version)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (phase, partition_key) DO UPDATE SET
                version = MAX(version, excluded.version)
            "#,
        )
        .bind(phase)
        .bind(partition_key)
        .bind(version)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM dispatch_attempts WHERE phase = ?1 AND partition_key = ?2")
            .bind(phase)
            .bind(partition_key)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM completion_records WHERE phase = ?1 AND partition_key = ?2")
            .bind(phase)
            .bind(partition_key)
            .execute(&mut **tx)
            .await?;
        Ok(true)
    }

    pub async fn archived_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM completion_records_archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl CompletionStore for SqliteCompletionStore {
    async fn get(
        &self,
        phase: &str,
        partition_key: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT version, body FROM completion_records WHERE phase = ?1 AND partition_key = ?2",
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(
                self.hydrate(row.get("body"), row.get("version")).await?,
            )),
            None => Ok(None),
        }
    }

    async fn compare_and_put(
        &self,
        record: &CompletionRecord,
        expected_version: u64,
    ) -> Result<CasResult, StoreError> {
        let last_activity = record.last_activity_at.map(timestamp);

        if expected_version == 0 {
            // The body's version field is ignored on read; the column is authoritative.
            let inserted = sqlx::query(
                r#"
                INSERT INTO completion_records (phase, partition_key, version, body, triggered, last_activity_at)
                VALUES (
                    ?1, ?2,
                    COALESCE(
                        (SELECT version FROM retired_record_versions WHERE phase = ?1 AND partition_key = ?2),
                        0
                    ) + 1,
                    ?3, ?4, ?5
                )
                ON CONFLICT (phase, partition_key) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(&record.phase)
            .bind(&record.partition_key)
            .bind(Self::encode(record, 1)?)
            .bind(record.triggered)
            .bind(last_activity.as_deref())
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = inserted {
                return Ok(CasResult::Success {
                    version: row.get::<i64, _>("version") as u64,
                });
            }
        }

        let version = expected_version + 1;
        let affected = if expected_version == 0 {
            0
        } else {
            let body = Self::encode(record, version)?;
            sqlx::query(
                r#"
                UPDATE completion_records
                SET version = ?1, body = ?2, triggered = ?3, last_activity_at = ?4
                WHERE phase = ?5 AND partition_key = ?6 AND version = ?7
                "#,
            )
            .bind(version as i64)
            .bind(&body)
            .bind(record.triggered)
            .bind(last_activity.as_deref())
            .bind(&record.phase)
            .bind(&record.partition_key)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 1 {
            return Ok(CasResult::Success { version });
        }

        let result = match self.current_version(&record.phase, &record.partition_key).await? {
            Some(actual) => CasResult::VersionConflict { actual },
            None => CasResult::NotFound,
        };
        debug!(
            phase = %record.phase,
            partition_key = %record.partition_key,
            expected_version,
            ?result,
            "Conditional write rejected"
        );
        Ok(result)
    }

    async fn compare_and_delete(
        &self,
        phase: &str,
        partition_key: &str,
        expected_version: u64,
    ) -> Result<CasResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT version FROM completion_records WHERE phase = ?1 AND partition_key = ?2",
        )
        .bind(phase)
        .bind(partition_key)
        .fetch_optional(&mut *tx)
        .await?;

        let actual = match row {
            None => return Ok(CasResult::NotFound),
            Some(row) => row.get::<i64, _>("version") as u64,
        };
        if actual != expected_version {
            return Ok(CasResult::VersionConflict { actual });
        }

        Self::archive_in(&mut tx, phase, partition_key, Utc::now()).await?;
        tx.commit().await?;
        Ok(CasResult::Success {
            version: expected_version,
        })
    }

    async fn record_dispatch(
        &self,
        phase: &str,
        partition_key: &str,
        attempt: DispatchAttempt,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_attempts (phase, partition_key, body, attempted_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE EXISTS (
                SELECT 1 FROM completion_records WHERE phase = ?1 AND partition_key = ?2
            )
            "#,
        )
        .bind(phase)
        .bind(partition_key)
        .bind(serde_json::to_string(&attempt)?)
        .bind(timestamp(attempt.attempted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self, since: DateTime<Utc>) -> Result<Vec<CompletionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT version, body FROM completion_records
            WHERE last_activity_at >= ?1
            ORDER BY partition_key ASC, phase ASC
            "#,
        )
        .bind(timestamp(since))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.hydrate(row.get("body"), row.get("version")).await?);
        }
        Ok(records)
    }

    async fn list_for_key(&self, partition_key: &str) -> Result<Vec<CompletionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT version, body FROM completion_records WHERE partition_key = ?1 ORDER BY phase ASC",
        )
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.hydrate(row.get("body"), row.get("version")).await?);
        }
        Ok(records)
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = sqlx::query(
            r#"
            SELECT phase, partition_key FROM completion_records
            WHERE last_activity_at IS NULL OR last_activity_at < ?1
            "#,
        )
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut moved = 0;
        let mut tx = self.pool.begin().await?;
        for row in &expired {
            let phase: String = row.get("phase");
            let partition_key: String = row.get("partition_key");
            if Self::archive_in(&mut tx, &phase, &partition_key, now).await? {
                moved += 1;
            }
        }
        tx.commit().await?;

        info!("Archived {} completion records older than {}", moved, cutoff);
        Ok(moved)
    }

    async fn load_health(&self, partition_key: &str) -> Result<Option<KeyHealth>, StoreError> {
        let row = sqlx::query("SELECT body FROM key_health WHERE partition_key = ?1")
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.get::<&str, _>("body"))?)),
            None => Ok(None),
        }
    }

    async fn save_health(&self, health: &KeyHealth) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO key_health (partition_key, state, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (partition_key) DO UPDATE SET
                state = excluded.state,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&health.partition_key)
        .bind(health.state.to_string())
        .bind(serde_json::to_string(health)?)
        .bind(timestamp(health.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_health(&self, partition_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM key_health WHERE partition_key = ?1")
            .bind(partition_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
