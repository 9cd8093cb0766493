//! Node configuration
//!
//! Values come from built-in defaults, optionally overlaid by a TOML file and
//! then by command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::chain::{DEFAULT_DIFFICULTY, DEFAULT_MINING_REWARD};
use crate::blockchain::{ChainStore, JsonFileStorage, SledStorage, StorageError};
use crate::network::P2PConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidValue(String),
}

/// Chain storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// sled database directory
    Sled,
    /// Single pretty-printed JSON file
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub api_port: u16,
    pub data_path: PathBuf,
    pub storage: StorageKind,
    pub seed_peers: Vec<String>,
    pub difficulty: usize,
    pub mining_reward: f64,
    pub max_peers: usize,
    pub heartbeat_interval_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12315,
            api_port: 8080,
            data_path: PathBuf::from("data/blockchain"),
            storage: StorageKind::Sled,
            seed_peers: Vec::new(),
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
            max_peers: 32,
            heartbeat_interval_ms: 1000,
            status_interval_ms: 10_000,
        }
    }
}

impl NodeConfig {
    /// Defaults, overlaid by the TOML file at `path` when one is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host must be set".to_string()));
        }
        if self.data_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("data_path must be set".to_string()));
        }
        if !(self.mining_reward.is_finite() && self.mining_reward >= 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "mining_reward must be a non-negative number, got {}",
                self.mining_reward
            )));
        }
        if self.difficulty > 64 {
            return Err(ConfigError::InvalidValue(format!(
                "difficulty cannot exceed the 64 hex digits of a hash, got {}",
                self.difficulty
            )));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidValue("max_peers must be at least 1".to_string()));
        }
        if self.heartbeat_interval_ms == 0 || self.status_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn p2p_config(&self) -> P2PConfig {
        P2PConfig {
            host: self.host.clone(),
            port: self.port,
            seed_peers: self.seed_peers.clone(),
            max_peers: self.max_peers,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            status_interval: Duration::from_millis(self.status_interval_ms),
        }
    }

    /// Opens the configured chain store under `data_path`
    pub fn open_store(&self) -> Result<Arc<dyn ChainStore>, StorageError> {
        match self.storage {
            StorageKind::Sled => Ok(Arc::new(SledStorage::new(&self.data_path)?)),
            StorageKind::Json => Ok(Arc::new(JsonFileStorage::new(
                self.data_path.join("chain.json"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.port, 12315);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.difficulty, 2);
        assert_eq!(config.mining_reward, 100.0);
        assert_eq!(config.storage, StorageKind::Sled);
        assert!(config.seed_peers.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            port = 13000
            storage = "json"
            seed_peers = ["127.0.0.1:12315"]
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 13000);
        assert_eq!(config.storage, StorageKind::Json);
        assert_eq!(config.seed_peers, vec!["127.0.0.1:12315".to_string()]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_peers, 32);
    }

    #[test]
    fn test_invalid_values() {
        assert!(NodeConfig::from_toml_str("port = \"high\"").is_err());

        let config = NodeConfig {
            max_peers: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let config = NodeConfig {
            mining_reward: -1.0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "api_port = 9090\ndifficulty = 3\n").unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.difficulty, 3);

        let missing = NodeConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(missing, Err(ConfigError::ReadError(_, _))));
    }

    #[test]
    fn test_open_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_path: dir.path().to_path_buf(),
            storage: StorageKind::Json,
            ..NodeConfig::default()
        };
        let store = config.open_store().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
