//! Cache configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::worker_pool;

/// Default configuration constants
pub mod defaults {
    /// 0 means one worker per logical core, at least four
    pub const POOL_SIZE: usize = 0;

    /// Asset chunk size: 1.5 MiB
    pub const CHUNK_SIZE: usize = crate::protocol::CHUNK_SIZE;

    /// Per-chunk RPC deadline in ms (0 = none)
    pub const RPC_TIMEOUT_MS: u64 = 0;

    /// Writes are committed on flush unless told otherwise
    pub const LAZY_COMMIT: bool = true;

    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

fn default_pool_size() -> usize {
    defaults::POOL_SIZE
}

fn default_chunk_size() -> usize {
    defaults::CHUNK_SIZE
}

fn default_rpc_timeout_ms() -> u64 {
    defaults::RPC_TIMEOUT_MS
}

fn default_lazy_commit() -> bool {
    defaults::LAZY_COMMIT
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_lazy_commit")]
    pub lazy_commit: bool,

    /// JSONL commit journal; no journal when unset
    #[serde(default)]
    pub journal_path: Option<PathBuf>,

    /// Text event log; no event log when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            chunk_size: default_chunk_size(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            lazy_commit: default_lazy_commit(),
            journal_path: None,
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::ReadError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: CacheConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Pool size after resolving `0` to the host default
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            worker_pool::default_pool_size()
        } else {
            self.pool_size
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationError("chunk_size must be positive".into()));
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::ValidationError(format!("invalid log level: {other}"))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MIN_POOL_SIZE;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CacheConfig::from_toml_str("").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.chunk_size, 1_572_864);
        assert!(config.lazy_commit);
        assert!(config.effective_pool_size() >= MIN_POOL_SIZE);
    }

    #[test]
    fn partial_document_overrides() {
        let config = CacheConfig::from_toml_str(
            r#"
            pool_size = 2
            rpc_timeout_ms = 500
            lazy_commit = false
            journal_path = "/tmp/journal.jsonl"
            "#,
        )
        .unwrap();
        assert_eq!(config.effective_pool_size(), 2);
        assert_eq!(config.rpc_timeout_ms, 500);
        assert!(!config.lazy_commit);
        assert_eq!(config.journal_path, Some(PathBuf::from("/tmp/journal.jsonl")));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            CacheConfig::from_toml_str("chunk_size = 0"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml_str("log_level = \"loud\""),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml_str("pool_size = \"many\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canistore.toml");
        let config = CacheConfig {
            pool_size: 6,
            log_file: Some(dir.path().join("events.log")),
            ..Default::default()
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(CacheConfig::load(&path).unwrap(), config);
        assert!(matches!(
            CacheConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::ReadError(_))
        ));
    }
}
