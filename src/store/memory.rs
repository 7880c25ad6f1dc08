use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{CasResult, CompletionRecord, CompletionStore, DispatchAttempt};
use crate::error::StoreError;
use crate::health::KeyHealth;

type RecordKey = (String, String);

/// Process-local store. Used by tests and `store.url = "memory"`.
#[derive(Debug, Default)]
pub struct InMemoryCompletionStore {
    records: RwLock<HashMap<RecordKey, CompletionRecord>>,
    archived: RwLock<Vec<CompletionRecord>>,
    /// Last version of each removed record; a re-created record continues from it
    retired: RwLock<HashMap<RecordKey, u64>>,
    health: RwLock<HashMap<String, KeyHealth>>,
}

impl InMemoryCompletionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Result<Vec<CompletionRecord>, StoreError> {
        Ok(self
            .archived
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .clone())
    }

    fn key(phase: &str, partition_key: &str) -> RecordKey {
        (phase.to_string(), partition_key.to_string())
    }

    fn retire(&self, record: CompletionRecord) -> Result<(), StoreError> {
        let key = Self::key(&record.phase, &record.partition_key);
        let mut retired = self.retired.write().map_err(|_| StoreError::Poisoned)?;
        let high_water = retired.entry(key).or_insert(0);
        *high_water = (*high_water).max(record.version);
        self.archived
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .push(record);
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for InMemoryCompletionStore {
    async fn get(
        &self,
        phase: &str,
        partition_key: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&Self::key(phase, partition_key)).cloned())
    }

    async fn compare_and_put(
        &self,
        record: &CompletionRecord,
        expected_version: u64,
    ) -> Result<CasResult, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let key = Self::key(&record.phase, &record.partition_key);

        let (version, dispatches) = match records.get(&key) {
            None if expected_version == 0 => {
                let retired = self.retired.read().map_err(|_| StoreError::Poisoned)?;
                (retired.get(&key).copied().unwrap_or(0) + 1, Vec::new())
            }
            None => return Ok(CasResult::NotFound),
            Some(existing) if existing.version != expected_version => {
                return Ok(CasResult::VersionConflict {
                    actual: existing.version,
                });
            }
            Some(existing) => (expected_version + 1, existing.dispatches.clone()),
        };

        let mut stored = record.clone();
        stored.version = version;
        stored.dispatches = dispatches;
        records.insert(key, stored);
        Ok(CasResult::Success { version })
    }

    async fn compare_and_delete(
        &self,
        phase: &str,
        partition_key: &str,
        expected_version: u64,
    ) -> Result<CasResult, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let key = Self::key(phase, partition_key);

        match records.get(&key) {
            None => return Ok(CasResult::NotFound),
            Some(existing) if existing.version != expected_version => {
                return Ok(CasResult::VersionConflict {
                    actual: existing.version,
                });
            }
            Some(_) => {}
        }

        if let Some(removed) = records.remove(&key) {
            self.retire(removed)?;
        }
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
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(record) = records.get_mut(&Self::key(phase, partition_key)) {
            record.dispatches.push(attempt);
        }
        Ok(())
    }

    async fn list_active(&self, since: DateTime<Utc>) -> Result<Vec<CompletionRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut active: Vec<CompletionRecord> = records
            .values()
            .filter(|r| r.last_activity_at.is_some_and(|at| at >= since))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            (a.partition_key.as_str(), a.phase.as_str())
                .cmp(&(b.partition_key.as_str(), b.phase.as_str()))
        });
        Ok(active)
    }

    async fn list_for_key(&self, partition_key: &str) -> Result<Vec<CompletionRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut found: Vec<CompletionRecord> = records
            .values()
            .filter(|r| r.partition_key == partition_key)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.phase.cmp(&b.phase));
        Ok(found)
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let expired: Vec<RecordKey> = records
            .iter()
            .filter(|(_, r)| r.last_activity_at.is_none_or(|at| at < cutoff))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(record) = records.remove(key) {
                self.retire(record)?;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn load_health(&self, partition_key: &str) -> Result<Option<KeyHealth>, StoreError> {
        let health = self.health.read().map_err(|_| StoreError::Poisoned)?;
        Ok(health.get(partition_key).cloned())
    }

    async fn save_health(&self, health: &KeyHealth) -> Result<(), StoreError> {
        self.health
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(health.partition_key.clone(), health.clone());
        Ok(())
    }

    async fn clear_health(&self, partition_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .health
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(partition_key)
            .is_some())
    }
}
