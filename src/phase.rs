use chrono::Duration;
use std::collections::HashSet;

use crate::config::PhaseConfig;
use crate::error::{ConfigError, OrchestratorError};
use crate::normalizer::NameNormalizer;

/// Processors a phase waits for, in configured order, plus the partial-trigger window.
#[derive(Debug, Clone)]
pub struct ExpectedProcessorSet {
    names: Vec<String>,
    max_wait: Duration,
}

impl ExpectedProcessorSet {
    pub fn new<I>(names: I, max_wait: Duration) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut seen = HashSet::new();
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| seen.insert(name.clone()))
            .collect();
        Self { names, max_wait }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

/// Where self-heal looks for a phase's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    pub table: String,
    pub key_column: String,
    pub min_rows: u64,
}

#[derive(Debug, Clone)]
pub struct PhaseDefinition {
    name: String,
    expected: ExpectedProcessorSet,
    normalizer: NameNormalizer,
    entry_url: Option<String>,
    artifact: Option<ArtifactTarget>,
}

impl PhaseDefinition {
    pub fn new(name: impl Into<String>, expected: ExpectedProcessorSet) -> Self {
        let normalizer = NameNormalizer::new(expected.names().to_vec(), Vec::new());
        Self {
            name: name.into(),
            expected,
            normalizer,
            entry_url: None,
            artifact: None,
        }
    }

    pub fn with_entry_url(mut self, url: impl Into<String>) -> Self {
        self.entry_url = Some(url.into());
        self
    }

    pub fn with_artifact(mut self, target: ArtifactTarget) -> Self {
        self.artifact = Some(target);
        self
    }

    pub fn with_aliases<A>(mut self, aliases: A) -> Self
    where
        A: IntoIterator<Item = (String, String)>,
    {
        self.normalizer = NameNormalizer::new(self.expected.names().to_vec(), aliases);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected(&self) -> &ExpectedProcessorSet {
        &self.expected
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    pub fn entry_url(&self) -> Option<&str> {
        self.entry_url.as_deref()
    }

    pub fn artifact(&self) -> Option<&ArtifactTarget> {
        self.artifact.as_ref()
    }
}

impl TryFrom<&PhaseConfig> for PhaseDefinition {
    type Error = ConfigError;

    fn try_from(config: &PhaseConfig) -> Result<Self, Self::Error> {
        let max_wait = i64::try_from(config.max_wait_secs)
            .map(Duration::seconds)
            .map_err(|_| {
                ConfigError::Invalid(format!("max_wait_secs too large for phase {}", config.name))
            })?;
        let expected = ExpectedProcessorSet::new(config.expected_processors.clone(), max_wait);

        let mut phase = PhaseDefinition::new(config.name.clone(), expected)
            .with_aliases(config.aliases.clone());
        if let Some(url) = &config.entry_url {
            phase = phase.with_entry_url(url.clone());
        }
        if let Some(table) = &config.artifact_table {
            phase = phase.with_artifact(ArtifactTarget {
                table: table.clone(),
                key_column: config.artifact_key_column.clone(),
                min_rows: config.min_rows,
            });
        }
        Ok(phase)
    }
}

/// Phases in dependency order. Completing phase N triggers the entry point of phase N+1.
#[derive(Debug, Clone)]
pub struct Pipeline {
    phases: Vec<PhaseDefinition>,
}

impl Pipeline {
    pub fn new(phases: Vec<PhaseDefinition>) -> Self {
        Self { phases }
    }

    pub fn from_config(phases: &[PhaseConfig]) -> Result<Self, ConfigError> {
        let phases = phases
            .iter()
            .map(PhaseDefinition::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(phases))
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&PhaseDefinition, OrchestratorError> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::UnknownPhase(name.to_string()))
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn next_after(&self, name: &str) -> Option<&PhaseDefinition> {
        self.position(name).and_then(|idx| self.phases.get(idx + 1))
    }

    pub fn previous(&self, name: &str) -> Option<&PhaseDefinition> {
        self.position(name)
            .and_then(|idx| idx.checked_sub(1))
            .and_then(|idx| self.phases.get(idx))
    }

    /// `name` and every phase after it.
    pub fn from_phase(&self, name: &str) -> &[PhaseDefinition] {
        match self.position(name) {
            Some(idx) => &self.phases[idx..],
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(vec![
            PhaseDefinition::new(
                "raw_load",
                ExpectedProcessorSet::new(["a", "b"], Duration::hours(4)),
            ),
            PhaseDefinition::new(
                "analytics",
                ExpectedProcessorSet::new(["summary"], Duration::hours(1)),
            )
            .with_entry_url("http://localhost/analytics"),
            PhaseDefinition::new(
                "precompute",
                ExpectedProcessorSet::new(["features"], Duration::hours(1)),
            )
            .with_entry_url("http://localhost/precompute"),
        ])
    }

    #[test]
    fn navigation_follows_dependency_order() {
        let p = pipeline();
        assert_eq!(p.next_after("raw_load").map(|d| d.name()), Some("analytics"));
        assert_eq!(p.next_after("precompute").map(|d| d.name()), None);
        assert_eq!(p.previous("raw_load").map(|d| d.name()), None);
        assert_eq!(p.previous("precompute").map(|d| d.name()), Some("analytics"));
        assert_eq!(
            p.from_phase("analytics").iter().map(|d| d.name()).collect::<Vec<_>>(),
            vec!["analytics", "precompute"]
        );
        assert!(p.from_phase("unknown").is_empty());
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let p = pipeline();
        assert!(matches!(
            p.require("export"),
            Err(OrchestratorError::UnknownPhase(name)) if name == "export"
        ));
    }

    #[test]
    fn expected_set_drops_duplicates_but_keeps_order() {
        let set = ExpectedProcessorSet::new(["c", "a", "c", "b"], Duration::minutes(1));
        assert_eq!(set.names(), &["c", "a", "b"]);
        assert_eq!(set.len(), 3);
    }
}
