use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::DispatchAttempt;

/// Self-heal trigger calls kept per key, newest last.
pub const HEAL_DISPATCH_HISTORY: usize = 20;

/// Self-heal view of one partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    StaleRunning,
    MissingOutput,
    Healing,
    FailedHeal,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Healthy => "healthy",
            HealthState::StaleRunning => "stale_running",
            HealthState::MissingOutput => "missing_output",
            HealthState::Healing => "healing",
            HealthState::FailedHeal => "failed_heal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyHealth {
    pub partition_key: String,
    pub state: HealthState,
    /// Earliest phase whose output was missing when the key left `healthy`
    pub broken_phase: Option<String>,
    pub heal_attempts: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Sweeps skip the key until this instant
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Re-drive calls made for this key. Kept here because the upstream
    /// record they would be audited on may have been cleared.
    #[serde(default)]
    pub heal_dispatches: Vec<DispatchAttempt>,
}

impl KeyHealth {
    pub fn new(partition_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            partition_key: partition_key.into(),
            state: HealthState::Healthy,
            broken_phase: None,
            heal_attempts: 0,
            last_checked_at: None,
            next_check_at: None,
            last_error: None,
            updated_at: now,
            heal_dispatches: Vec::new(),
        }
    }

    pub fn record_heal_dispatch(&mut self, attempt: DispatchAttempt) {
        self.heal_dispatches.push(attempt);
        let overflow = self.heal_dispatches.len().saturating_sub(HEAL_DISPATCH_HISTORY);
        self.heal_dispatches.drain(..overflow);
    }

    /// Forget a previous failure so repair starts over against a new broken phase.
    pub fn restart_repair(&mut self) {
        self.heal_attempts = 0;
        self.next_check_at = None;
        self.last_error = None;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_at.is_none_or(|at| at <= now)
    }

    pub fn mark_healthy(&mut self, now: DateTime<Utc>) {
        self.state = HealthState::Healthy;
        self.broken_phase = None;
        self.heal_attempts = 0;
        self.next_check_at = None;
        self.last_error = None;
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }

    pub fn transition(&mut self, state: HealthState, now: DateTime<Utc>) {
        self.state = state;
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }
}
