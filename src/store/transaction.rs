// Optimistic read-modify-write over the CAS primitives, retried with
// exponential backoff when another handler committed first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use super::{CasResult, CompletionRecord, CompletionStore};
use crate::config::TransactionRetryConfig;
use crate::error::StoreError;

/// What a transaction body decided to do with the record it was handed.
#[derive(Debug)]
pub enum TxOutcome<T> {
    Commit(CompletionRecord, T),
    Abort(T),
}

#[derive(Debug, Clone)]
pub struct TransactionRetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for TransactionRetryPolicy {
    fn default() -> Self {
        Self::from(&TransactionRetryConfig::default())
    }
}

impl From<&TransactionRetryConfig> for TransactionRetryPolicy {
    fn from(config: &TransactionRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl TransactionRetryPolicy {
    /// Delays between attempts: base, 2*base, 4*base ... capped at `max_delay`.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        let use_jitter = self.jitter;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(move |delay| if use_jitter { jitter(delay) } else { delay })
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// One read, body run and conditional write.
async fn attempt_once<T, F>(
    store: &dyn CompletionStore,
    phase: &str,
    partition_key: &str,
    body: &Mutex<F>,
    attempt: usize,
) -> Result<T, StoreError>
where
    F: FnMut(CompletionRecord) -> TxOutcome<T>,
{
    let current = store
        .get(phase, partition_key)
        .await?
        .unwrap_or_else(|| CompletionRecord::empty(phase, partition_key));
    let expected = current.version;

    let outcome = {
        let mut body = body.lock().unwrap_or_else(|p| p.into_inner());
        (*body)(current)
    };

    let (record, value) = match outcome {
        TxOutcome::Abort(value) => return Ok(value),
        TxOutcome::Commit(record, value) => (record, value),
    };

    let actual = match store.compare_and_put(&record, expected).await? {
        CasResult::Success { version } => {
            debug!(phase, partition_key, version, attempt, "Transaction committed");
            return Ok(value);
        }
        CasResult::VersionConflict { actual } => actual,
        CasResult::NotFound => 0,
    };

    debug!(phase, partition_key, expected, actual, attempt, "Transaction lost race");
    Err(StoreError::VersionConflict {
        phase: phase.to_string(),
        partition_key: partition_key.to_string(),
        expected,
        actual,
    })
}

/// Run `body` against the current record for `(phase, partition_key)` (or an
/// empty one) and commit its result atomically. On a version conflict the
/// record is re-read and `body` runs again against the winner's state.
pub async fn transact<T, F>(
    store: &dyn CompletionStore,
    policy: &TransactionRetryPolicy,
    phase: &str,
    partition_key: &str,
    body: F,
) -> Result<T, StoreError>
where
    F: FnMut(CompletionRecord) -> TxOutcome<T> + Send,
    T: Send,
{
    let body_cell = Mutex::new(body);
    let attempt_counter = AtomicUsize::new(0);
    let body = &body_cell;
    let attempts = &attempt_counter;

    let result = RetryIf::spawn(
        policy.strategy(),
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            attempt_once(store, phase, partition_key, body, attempt)
        },
        |err: &StoreError| matches!(err, StoreError::VersionConflict { .. }),
    )
    .await;

    match result {
        Err(StoreError::VersionConflict { .. }) => {
            let attempts = attempt_counter.load(Ordering::SeqCst);
            warn!(phase, partition_key, attempts, "Transaction retries exhausted");
            Err(StoreError::Contention {
                phase: phase.to_string(),
                partition_key: partition_key.to_string(),
                attempts,
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::KeyHealth;
    use crate::store::{DispatchAttempt, InMemoryCompletionStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    /// Reports a conflict for the first `conflicts` writes, then delegates.
    struct ContendedStore {
        inner: InMemoryCompletionStore,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl CompletionStore for ContendedStore {
        async fn get(&self, phase: &str, key: &str) -> Result<Option<CompletionRecord>, StoreError> {
            self.inner.get(phase, key).await
        }

        async fn compare_and_put(
            &self,
            record: &CompletionRecord,
            expected_version: u64,
        ) -> Result<CasResult, StoreError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Ok(CasResult::VersionConflict {
                    actual: expected_version + 1,
                });
            }
            self.inner.compare_and_put(record, expected_version).await
        }

        async fn compare_and_delete(&self, phase: &str, key: &str, v: u64) -> Result<CasResult, StoreError> {
            self.inner.compare_and_delete(phase, key, v).await
        }

        async fn record_dispatch(&self, phase: &str, key: &str, a: DispatchAttempt) -> Result<(), StoreError> {
            self.inner.record_dispatch(phase, key, a).await
        }

        async fn list_active(&self, since: DateTime<Utc>) -> Result<Vec<CompletionRecord>, StoreError> {
            self.inner.list_active(since).await
        }

        async fn list_for_key(&self, key: &str) -> Result<Vec<CompletionRecord>, StoreError> {
            self.inner.list_for_key(key).await
        }

        async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.archive_before(cutoff).await
        }

        async fn load_health(&self, key: &str) -> Result<Option<KeyHealth>, StoreError> {
            self.inner.load_health(key).await
        }

        async fn save_health(&self, health: &KeyHealth) -> Result<(), StoreError> {
            self.inner.save_health(health).await
        }

        async fn clear_health(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.clear_health(key).await
        }
    }

    fn fast_policy(max_attempts: usize) -> TransactionRetryPolicy {
        TransactionRetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    fn touch(mut record: CompletionRecord) -> TxOutcome<u64> {
        record.last_activity_at = Some(Utc::now());
        let seen = record.version;
        TxOutcome::Commit(record, seen)
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_commit() {
        let store = ContendedStore {
            inner: InMemoryCompletionStore::new(),
            conflicts: AtomicUsize::new(2),
        };
        let mut runs = 0;

        let seen = transact(&store, &fast_policy(5), "raw_load", "2024-03-01", |record| {
            runs += 1;
            touch(record)
        })
        .await
        .unwrap();

        assert_eq!(seen, 0);
        assert_eq!(runs, 3);
        let stored = store.get("raw_load", "2024-03-01").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_contention() {
        let store = ContendedStore {
            inner: InMemoryCompletionStore::new(),
            conflicts: AtomicUsize::new(10),
        };

        let err = transact(&store, &fast_policy(3), "raw_load", "2024-03-01", touch)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Contention { attempts: 3, .. }));
        assert!(store.get("raw_load", "2024-03-01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_writes_nothing() {
        let store = InMemoryCompletionStore::new();
        let value = transact(&store, &fast_policy(3), "raw_load", "k", |_| TxOutcome::Abort(7))
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(store.get("raw_load", "k").await.unwrap().is_none());
    }

    #[test]
    fn strategy_doubles_from_base_and_caps() {
        let policy = TransactionRetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: false,
        };
        let delays: Vec<u64> = policy.strategy().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![20, 40, 80, 100, 100]);
    }
}
