use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Orchestrator counters. One instance is shared by every component of a
/// running orchestrator.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    pub events_received: AtomicU64,
    pub events_ignored: AtomicU64,
    pub duplicate_completions: AtomicU64,
    pub triggers_all_complete: AtomicU64,
    pub triggers_timeout: AtomicU64,
    pub dispatch_successes: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub contention_failures: AtomicU64,
    pub heals_attempted: AtomicU64,
    pub heals_failed: AtomicU64,
    pub keys_recovered: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self, raw_name: &str) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
        debug!(raw_name, "Completion from unknown processor dropped");
    }

    pub fn record_duplicate(&self) {
        self.duplicate_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger(&self, timeout: bool) {
        let counter = if timeout {
            &self.triggers_timeout
        } else {
            &self.triggers_all_complete
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, success: bool) {
        let counter = if success {
            &self.dispatch_successes
        } else {
            &self.dispatch_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contention(&self) {
        self.contention_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heal(&self, succeeded: bool) {
        self.heals_attempted.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.heals_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_recovery(&self) {
        self.keys_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            duplicate_completions: self.duplicate_completions.load(Ordering::Relaxed),
            triggers_all_complete: self.triggers_all_complete.load(Ordering::Relaxed),
            triggers_timeout: self.triggers_timeout.load(Ordering::Relaxed),
            dispatch_successes: self.dispatch_successes.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            contention_failures: self.contention_failures.load(Ordering::Relaxed),
            heals_attempted: self.heals_attempted.load(Ordering::Relaxed),
            heals_failed: self.heals_failed.load(Ordering::Relaxed),
            keys_recovered: self.keys_recovered.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            events = stats.events_received,
            ignored = stats.events_ignored,
            duplicates = stats.duplicate_completions,
            triggers_all_complete = stats.triggers_all_complete,
            triggers_timeout = stats.triggers_timeout,
            dispatch_ok = stats.dispatch_successes,
            dispatch_failed = stats.dispatch_failures,
            contention = stats.contention_failures,
            heals = stats.heals_attempted,
            heals_failed = stats.heals_failed,
            recovered = stats.keys_recovered,
            "Orchestrator metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub events_received: u64,
    pub events_ignored: u64,
    pub duplicate_completions: u64,
    pub triggers_all_complete: u64,
    pub triggers_timeout: u64,
    pub dispatch_successes: u64,
    pub dispatch_failures: u64,
    pub contention_failures: u64,
    pub heals_attempted: u64,
    pub heals_failed: u64,
    pub keys_recovered: u64,
}

/// Logs the elapsed time of an operation when finished.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        info!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
