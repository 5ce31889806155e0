use orbit_raft::RaftConfig as ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node: NodeConfig,
    pub raft: RaftConfig,
    pub api: ApiConfig,
    pub build: BuildConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node ID; generated and persisted on first setup when absent
    pub node_id: Option<String>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub port: u16,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub apply_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub max_append_entries: usize,
    pub snapshot_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Image registry that build tags are prefixed with
    pub registry: String,
    pub flush_interval_ms: u64,
    pub docker_binary: String,
    /// Push the image after a successful build
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            port: 6501,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_interval_ms: 300,
            apply_timeout_ms: 10_000,
            rpc_timeout_ms: 5_000,
            max_append_entries: 256,
            snapshot_threshold: 4096,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "0.0.0.0".to_string(),
            port: 6500,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            registry: "127.0.0.1:6510".to_string(),
            flush_interval_ms: 2000,
            docker_binary: "docker".to_string(),
            push: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let raft = &self.raft;
        if raft.election_timeout_min_ms == 0
            || raft.election_timeout_min_ms > raft.election_timeout_max_ms
        {
            return Err(ConfigError::Invalid(format!(
                "election timeout range {}..{} ms is empty",
                raft.election_timeout_min_ms, raft.election_timeout_max_ms
            )));
        }
        if raft.heartbeat_interval_ms == 0
            || raft.heartbeat_interval_ms >= raft.election_timeout_min_ms
        {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval {} ms must be positive and below the election timeout",
                raft.heartbeat_interval_ms
            )));
        }
        if raft.max_append_entries == 0 {
            return Err(ConfigError::Invalid("max_append_entries must be positive".into()));
        }
        if self.build.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("build flush interval must be positive".into()));
        }
        if self.build.registry.is_empty() {
            return Err(ConfigError::Invalid("build registry must be set".into()));
        }
        Ok(())
    }

    /// Consensus settings for the node named `node_id`
    pub fn consensus_config(&self, node_id: &str) -> ConsensusConfig {
        let raft = &self.raft;
        ConsensusConfig {
            node_id: node_id.to_string(),
            election_timeout_min: Duration::from_millis(raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(raft.heartbeat_interval_ms),
            apply_timeout: Duration::from_millis(raft.apply_timeout_ms),
            max_append_entries: raft.max_append_entries,
            snapshot_threshold: raft.snapshot_threshold,
            ..ConsensusConfig::default()
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.rpc_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.build.flush_interval_ms)
    }
}
