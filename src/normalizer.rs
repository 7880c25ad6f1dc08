//! Completion-event name normalization.
//!
//! Emitters report their identity however their framework spells it
//! (`PlayerGameSummaryProcessor`, `nbac-schedule-processor`, ...). The
//! normalizer maps those onto the canonical names of one phase's
//! expected processor set, or rejects them.
//!
//! Resolution order:
//! 1. exact match (canonical names and configured aliases)
//! 2. the event's `output_table` hint, when it exactly names an expected processor
//! 3. regex fallback: strip decorations, CamelCase to snake_case, lower-case

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static CAMEL_DECORATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Processor|Scraper|Worker|Job|Task)$").unwrap());
static ACRONYM_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());
static CAMEL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\-\./:]+").unwrap());
static SNAKE_DECORATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:_(?:processor|scraper|worker|job|task))+$").unwrap());
static REPEATED_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

/// How a raw emitter name was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameResolution {
    Exact(String),
    OutputTable(String),
    Normalized(String),
    Rejected { attempted: String },
}

impl NameResolution {
    pub fn canonical(&self) -> Option<&str> {
        match self {
            NameResolution::Exact(name)
            | NameResolution::OutputTable(name)
            | NameResolution::Normalized(name) => Some(name),
            NameResolution::Rejected { .. } => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, NameResolution::Rejected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct NameNormalizer {
    expected: Vec<String>,
    /// canonical names keyed by themselves, aliases keyed lower-case
    exact: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

impl NameNormalizer {
    pub fn new<I, A>(expected: I, aliases: A) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        A: IntoIterator<Item = (String, String)>,
    {
        let expected: Vec<String> = expected.into_iter().map(Into::into).collect();
        let exact = expected
            .iter()
            .map(|name| (name.clone(), name.clone()))
            .collect();
        let aliases = aliases
            .into_iter()
            .map(|(alias, canonical)| (alias.to_lowercase(), canonical))
            .collect();

        Self {
            expected,
            exact,
            aliases,
        }
    }

    pub fn normalize(&self, raw_name: &str, output_table: Option<&str>) -> NameResolution {
        let trimmed = raw_name.trim();

        if let Some(canonical) = self.exact.get(trimmed) {
            return NameResolution::Exact(canonical.clone());
        }
        if let Some(canonical) = self.aliases.get(&trimmed.to_lowercase()) {
            return NameResolution::Exact(canonical.clone());
        }

        if let Some(table) = output_table.map(str::trim) {
            if let Some(canonical) = self.exact.get(table) {
                return NameResolution::OutputTable(canonical.clone());
            }
        }

        let candidate = canonicalize(trimmed);
        match self.exact.get(&candidate) {
            Some(canonical) => NameResolution::Normalized(canonical.clone()),
            None => NameResolution::Rejected {
                attempted: candidate,
            },
        }
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }
}

/// Regex fallback shared by every phase.
pub fn canonicalize(raw: &str) -> String {
    let stripped = CAMEL_DECORATION.replace(raw.trim(), "");
    let snake = ACRONYM_BOUNDARY.replace_all(&stripped, "${1}_${2}");
    let snake = CAMEL_BOUNDARY.replace_all(&snake, "${1}_${2}");
    let snake = SEPARATORS.replace_all(&snake, "_").to_lowercase();
    let snake = REPEATED_UNDERSCORE.replace_all(&snake, "_");
    let snake = SNAKE_DECORATION.replace(snake.trim_matches('_'), "");
    snake.trim_matches('_').to_string()
}
