// Partial-completion fallback. Pure: no clock, no store.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::phase::ExpectedProcessorSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvaluation {
    pub should_trigger_on_timeout: bool,
    /// Expected processors not yet completed, in configured order
    pub missing: Vec<String>,
    pub elapsed: Option<Duration>,
}

/// Decide whether a partially complete phase should advance on timeout.
pub fn evaluate<I, S>(
    first_completion_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_wait: Duration,
    already_triggered: bool,
    completed: I,
    expected: &ExpectedProcessorSet,
) -> TimeoutEvaluation
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let missing = missing_processors(expected, completed);
    let elapsed = first_completion_at.map(|first| now - first);
    let window_closed = elapsed.is_some_and(|elapsed| elapsed >= max_wait);

    TimeoutEvaluation {
        should_trigger_on_timeout: window_closed && !already_triggered,
        missing,
        elapsed,
    }
}

pub fn missing_processors<I, S>(expected: &ExpectedProcessorSet, completed: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let completed: HashSet<String> = completed
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect();

    expected
        .names()
        .iter()
        .filter(|name| !completed.contains(name.as_str()))
        .cloned()
        .collect()
}
