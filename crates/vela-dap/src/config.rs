//! Adapter configuration.
//!
//! Loaded from a TOML file given via `--config` or `VELA_DAP_CONFIG`. Every
//! field has a default, and an unreadable or invalid file falls back to the
//! defaults with a logged warning rather than refusing to start.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DapConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub stops: StopConfig,
    #[serde(default)]
    pub variables: VariablesConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing-subscriber` env-filter directive string.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EvaluationConfig {
    /// Upper bound for a single expression evaluation, in milliseconds.
    #[serde(default = "default_eval_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StopConfig {
    /// When true, any accepted stop suspends the whole VM and `stopped`
    /// events carry `allThreadsStopped`. Off by default: only the event
    /// thread suspends.
    #[serde(default)]
    pub all_threads: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VariablesConfig {
    /// Maximum live `variablesReference` entries before the oldest are
    /// evicted.
    #[serde(default = "default_max_refs")]
    pub max_refs: usize,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_eval_timeout_ms() -> u64 {
    2_000
}

fn default_max_refs() -> usize {
    10_000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_eval_timeout_ms(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self { all_threads: false }
    }
}

impl Default for VariablesConfig {
    fn default() -> Self {
        Self {
            max_refs: default_max_refs(),
        }
    }
}

impl DapConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: DapConfig = toml::from_str("").unwrap();
        assert_eq!(config, DapConfig::default());
        assert_eq!(config.evaluation.timeout_ms, 2_000);
        assert!(!config.stops.all_threads);
        assert_eq!(config.variables.max_refs, 10_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: DapConfig = toml::from_str(
            r#"
            [stops]
            all_threads = true

            [evaluation]
            timeout_ms = 250
            "#,
        )
        .unwrap();
        assert!(config.stops.all_threads);
        assert_eq!(config.evaluation.timeout_ms, 250);
        assert_eq!(config.variables.max_refs, 10_000);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<DapConfig>("[stops]\nall_thread = true\n").is_err());
    }
}
