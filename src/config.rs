use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "phase-orchestrator.toml";
const ENV_PREFIX: &str = "PHASE_ORCHESTRATOR";

static SQL_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap());

/// Main configuration structure for the orchestrator
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Completion store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Outbound trigger settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Self-heal sweep settings
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Downstream artifact store used by self-heal
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Pipeline phases in dependency order
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL, or "memory" for a process-local store
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Run embedded migrations at startup
    pub auto_migrate: bool,
    /// Retry policy for contended transactions
    pub retry: TransactionRetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.phase-orchestrator/completions.db".to_string(),
            max_connections: 10,
            auto_migrate: true,
            retry: TransactionRetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionRetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for TransactionRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 20,
            max_delay_ms: 1000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// Identity tokens from the GCP metadata server
    MetadataServer,
    /// A fixed bearer token from configuration
    StaticToken,
    /// No Authorization header (local targets)
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub credentials: CredentialMode,
    /// Bearer token used with `credentials = "static_token"`
    pub static_token: Option<String>,
    pub metadata_url: String,
    pub metadata_timeout_secs: u64,
    /// How long fetched identity tokens are reused
    pub token_cache_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            credentials: CredentialMode::MetadataServer,
            static_token: None,
            metadata_url: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity".to_string(),
            metadata_timeout_secs: 2,
            token_cache_ttl_secs: 50 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub sweep_interval_secs: u64,
    /// No activity for this long with missing output means the run is stale
    pub staleness_secs: u64,
    /// Triggered records get this long before missing output counts as a failed dispatch
    pub grace_secs: u64,
    /// Records active within this window are swept
    pub lookback_hours: u64,
    pub max_heal_attempts: u32,
    pub artifact_poll_interval_secs: u64,
    pub artifact_poll_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_jitter_secs: u64,
    pub retention_days: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15 * 60,
            staleness_secs: 2 * 60 * 60,
            grace_secs: 30 * 60,
            lookback_hours: 72,
            max_heal_attempts: 3,
            artifact_poll_interval_secs: 30,
            artifact_poll_attempts: 10,
            backoff_base_secs: 15 * 60,
            backoff_max_secs: 12 * 60 * 60,
            backoff_jitter_secs: 60,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// SQLite URL of the warehouse mirror used for existence checks
    pub url: Option<String>,
    pub query_timeout_secs: u64,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            url: None,
            query_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// JSON lines instead of human readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhaseConfig {
    pub name: String,
    /// Canonical processor names required before the next phase starts
    pub expected_processors: Vec<String>,
    pub max_wait_secs: u64,
    /// HTTP entry point that starts this phase
    #[serde(default)]
    pub entry_url: Option<String>,
    /// Table holding this phase's output, checked by self-heal
    #[serde(default)]
    pub artifact_table: Option<String>,
    #[serde(default = "default_key_column")]
    pub artifact_key_column: String,
    #[serde(default = "default_min_rows")]
    pub min_rows: u64,
    /// Raw emitter names mapped straight to canonical names
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

fn default_key_column() -> String {
    "partition_key".to_string()
}

fn default_min_rows() -> u64 {
    1
}

impl OrchestratorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (explicit path, or phase-orchestrator.toml)
    /// 3. Environment variables (prefixed with PHASE_ORCHESTRATOR__)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: OrchestratorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> anyhow::Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phases.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[phases]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(ConfigError::Invalid("phase name cannot be empty".to_string()));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate phase name '{}'",
                    phase.name
                )));
            }
            if phase.expected_processors.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "phase '{}' has no expected_processors",
                    phase.name
                )));
            }
            let mut names = HashSet::new();
            for name in &phase.expected_processors {
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "phase '{}' lists processor '{}' twice",
                        phase.name, name
                    )));
                }
            }
            for (alias, canonical) in &phase.aliases {
                if !names.contains(canonical.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "alias '{}' in phase '{}' points at unknown processor '{}'",
                        alias, phase.name, canonical
                    )));
                }
            }
            if phase.max_wait_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "phase '{}' needs max_wait_secs > 0",
                    phase.name
                )));
            }
            if let Some(table) = &phase.artifact_table {
                if !SQL_IDENTIFIER.is_match(table) {
                    return Err(ConfigError::Invalid(format!(
                        "artifact_table '{}' is not a valid identifier",
                        table
                    )));
                }
            }
            if !SQL_IDENTIFIER.is_match(&phase.artifact_key_column) {
                return Err(ConfigError::Invalid(format!(
                    "artifact_key_column '{}' is not a valid identifier",
                    phase.artifact_key_column
                )));
            }
        }

        if self.store.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.dispatch.credentials == CredentialMode::StaticToken
            && self.dispatch.static_token.is_none()
        {
            return Err(ConfigError::Invalid(
                "dispatch.static_token is required with credentials = \"static_token\"".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
        [store]
        url = "memory"

        [[phases]]
        name = "raw_load"
        expected_processors = ["bdl_boxscores", "nbac_schedule"]
        max_wait_secs = 14400
        artifact_table = "nba_raw.bdl_boxscores"

        [[phases]]
        name = "analytics"
        expected_processors = ["player_game_summary"]
        max_wait_secs = 3600
        entry_url = "https://analytics.example.run.app/process"
        aliases = { "PlayerGameSummaryProcessor" = "player_game_summary" }
    "#;

    #[test]
    fn parses_pipeline_with_section_defaults() {
        let config = OrchestratorConfig::from_toml_str(PIPELINE).unwrap();

        assert_eq!(config.store.url, "memory");
        assert_eq!(config.store.retry.max_attempts, 5);
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.phases[0].artifact_key_column, "partition_key");
        assert_eq!(config.phases[1].min_rows, 1);
        assert_eq!(config.reconciler.max_heal_attempts, 3);
        assert_eq!(config.dispatch.credentials, CredentialMode::MetadataServer);
    }

    #[test]
    fn rejects_duplicate_phases_and_bad_identifiers() {
        let duplicate = r#"
            [[phases]]
            name = "raw_load"
            expected_processors = ["a"]
            max_wait_secs = 60
            [[phases]]
            name = "raw_load"
            expected_processors = ["b"]
            max_wait_secs = 60
        "#;
        assert!(matches!(
            OrchestratorConfig::from_toml_str(duplicate),
            Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")
        ));

        let injection = r#"
            [[phases]]
            name = "raw_load"
            expected_processors = ["a"]
            max_wait_secs = 60
            artifact_table = "t; DROP TABLE x"
        "#;
        assert!(OrchestratorConfig::from_toml_str(injection).is_err());
    }

    #[test]
    fn rejects_empty_pipeline_and_dangling_alias() {
        assert!(OrchestratorConfig::from_toml_str("").is_err());

        let dangling = r#"
            [[phases]]
            name = "raw_load"
            expected_processors = ["a"]
            max_wait_secs = 60
            aliases = { "Alpha" = "missing" }
        "#;
        assert!(OrchestratorConfig::from_toml_str(dangling).is_err());
    }

    #[test]
    fn static_token_mode_requires_token() {
        let toml = r#"
            [dispatch]
            credentials = "static_token"
            [[phases]]
            name = "raw_load"
            expected_processors = ["a"]
            max_wait_secs = 60
        "#;
        assert!(OrchestratorConfig::from_toml_str(toml).is_err());
    }
}
