//! Completion store: the only shared mutable state in the orchestrator.
//!
//! Backends expose compare-and-swap primitives keyed by `(phase, partition_key)`;
//! [`transaction::transact`] turns them into a retried read-modify-write that
//! linearizes concurrent handlers. Nothing outside this module writes a
//! [`CompletionRecord`] except through that helper.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod transaction;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StoreError;
use crate::health::KeyHealth;

pub use memory::InMemoryCompletionStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteCompletionStore;
pub use transaction::{transact, TransactionRetryPolicy, TxOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCompletion {
    pub processor: String,
    pub correlation_id: String,
    pub status: CompletionStatus,
    pub completed_at: DateTime<Utc>,
    pub output_rows: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    AllComplete,
    Timeout,
    /// Outbound only: a self-heal re-drive. Never stored as a record's reason.
    SelfHeal,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerReason::AllComplete => "all_complete",
            TriggerReason::Timeout => "timeout",
            TriggerReason::SelfHeal => "self_heal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrigin {
    Tracker,
    TimeoutSweep,
    SelfHeal,
}

/// Audit entry for one outbound trigger call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub attempted_at: DateTime<Utc>,
    pub target_phase: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub bypass_upstream_check: bool,
    pub origin: DispatchOrigin,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub phase: String,
    pub partition_key: String,
    /// 0 until first committed
    pub version: u64,
    pub completions: BTreeMap<String, ProcessorCompletion>,
    pub first_completion_at: Option<DateTime<Utc>>,
    pub completed_count: usize,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub trigger_reason: Option<TriggerReason>,
    pub missing_processors: Vec<String>,
    pub correlation_id: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Owned by `record_dispatch`; `compare_and_put` never writes it
    #[serde(default)]
    pub dispatches: Vec<DispatchAttempt>,
}

impl CompletionRecord {
    pub fn empty(phase: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            partition_key: partition_key.into(),
            version: 0,
            completions: BTreeMap::new(),
            first_completion_at: None,
            completed_count: 0,
            triggered: false,
            triggered_at: None,
            trigger_reason: None,
            missing_processors: Vec::new(),
            correlation_id: None,
            last_activity_at: None,
            dispatches: Vec::new(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn contains(&self, processor: &str) -> bool {
        self.completions.contains_key(processor)
    }

    /// Insert a completion unless the processor already reported. Returns whether it was new.
    pub fn insert_completion(&mut self, completion: ProcessorCompletion, now: DateTime<Utc>) -> bool {
        if self.contains(&completion.processor) {
            return false;
        }
        if self.first_completion_at.is_none() {
            self.first_completion_at = Some(now);
        }
        if self.correlation_id.is_none() {
            self.correlation_id = Some(completion.correlation_id.clone());
        }
        self.completions
            .insert(completion.processor.clone(), completion);
        self.completed_count = self.completions.len();
        self.last_activity_at = Some(now);
        true
    }

    /// Flip `triggered` once. Returns false if it was already set.
    pub fn mark_triggered(
        &mut self,
        reason: TriggerReason,
        missing: Vec<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.triggered {
            return false;
        }
        self.triggered = true;
        self.triggered_at = Some(now);
        self.trigger_reason = Some(reason);
        self.missing_processors = match reason {
            TriggerReason::Timeout => missing,
            _ => Vec::new(),
        };
        self.last_activity_at = Some(now);
        true
    }

    pub fn completed_names(&self) -> impl Iterator<Item = &str> {
        self.completions.keys().map(String::as_str)
    }

    pub fn last_dispatch(&self) -> Option<&DispatchAttempt> {
        self.dispatches.last()
    }
}

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Success { version: u64 },
    NotFound,
    VersionConflict { actual: u64 },
}

impl CasResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CasResult::Success { .. })
    }
}

/// Storage backend for completion records and per-key health.
///
/// `compare_and_put` with `expected_version == 0` inserts only when no record
/// exists; otherwise it updates only when the stored version matches. An update
/// stores `expected_version + 1`. Versions never repeat for a key: a record
/// re-created after a delete or archive starts above the removed one's version.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn get(&self, phase: &str, partition_key: &str)
        -> Result<Option<CompletionRecord>, StoreError>;

    async fn compare_and_put(
        &self,
        record: &CompletionRecord,
        expected_version: u64,
    ) -> Result<CasResult, StoreError>;

    /// Archive and remove a record if its version still matches.
    async fn compare_and_delete(
        &self,
        phase: &str,
        partition_key: &str,
        expected_version: u64,
    ) -> Result<CasResult, StoreError>;

    /// Best-effort audit append. Silently ignored when the record does not exist.
    async fn record_dispatch(
        &self,
        phase: &str,
        partition_key: &str,
        attempt: DispatchAttempt,
    ) -> Result<(), StoreError>;

    /// Records with activity at or after `since`, across all phases.
    async fn list_active(&self, since: DateTime<Utc>) -> Result<Vec<CompletionRecord>, StoreError>;

    async fn list_for_key(&self, partition_key: &str) -> Result<Vec<CompletionRecord>, StoreError>;

    /// Archive records whose last activity is older than `cutoff`. Returns how many moved.
    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn load_health(&self, partition_key: &str) -> Result<Option<KeyHealth>, StoreError>;

    async fn save_health(&self, health: &KeyHealth) -> Result<(), StoreError>;

    async fn clear_health(&self, partition_key: &str) -> Result<bool, StoreError>;
}
