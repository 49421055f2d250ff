//! Process configuration: a TOML file plus environment overrides, loaded
//! once at startup.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_store_path() -> PathBuf {
    crate::store::Store::default_path()
}

fn default_downstream_command() -> String {
    "mcp-server".to_string()
}

fn default_downstream_args() -> Vec<String> {
    Vec::new()
}

fn default_failure_threshold() -> i64 {
    crate::circuit_breaker::DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown_seconds() -> i64 {
    crate::circuit_breaker::DEFAULT_COOLDOWN_SECONDS
}

fn default_confirmation_ttl_seconds() -> i64 {
    crate::store::confirmation::DEFAULT_TTL_SECONDS
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default = "default_downstream_command")]
    pub downstream_command: String,

    #[serde(default = "default_downstream_args")]
    pub downstream_args: Vec<String>,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: i64,

    #[serde(default = "default_cooldown_seconds")]
    pub circuit_breaker_cooldown_seconds: i64,

    #[serde(default = "default_confirmation_ttl_seconds")]
    pub confirmation_ttl_seconds: i64,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            downstream_command: default_downstream_command(),
            downstream_args: default_downstream_args(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_cooldown_seconds: default_cooldown_seconds(),
            confirmation_ttl_seconds: default_confirmation_ttl_seconds(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads from `path`, falling back to an all-defaults config if the
    /// file doesn't exist — a missing config file is not an error, an
    /// unparseable one is.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("toolsentinel").join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.circuit_breaker_failure_threshold, 2);
    }

    #[test]
    fn parses_a_minimal_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "downstream_command = \"custom-server\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.downstream_command, "custom-server");
        assert_eq!(config.circuit_breaker_cooldown_seconds, 120);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid toml").unwrap();

        assert!(Config::load(&path).is_err());
    }
}
