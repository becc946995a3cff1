use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::consensus::ConsensusConfig;

/// Top-level node configuration, loaded from TOML with per-field defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_genesis_file")]
    pub genesis_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_timeout_propose_ms")]
    pub timeout_propose_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_propose_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_prevote_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_prevote_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_precommit_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_precommit_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_commit_ms: u64,
    #[serde(default)]
    pub skip_timeout_commit: bool,
    #[serde(default = "default_true")]
    pub create_empty_blocks: bool,
    #[serde(default)]
    pub create_empty_blocks_interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_pruning_window")]
    pub pruning_window: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservabilitySection {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen_addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub module_levels: Option<String>,
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_genesis_file() -> String {
    "config/genesis.json".to_string()
}
fn default_timeout_propose_ms() -> u64 {
    3000
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_delta_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_pruning_window() -> u64 {
    1000
}
fn default_metrics_listen() -> String {
    "0.0.0.0:26660".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            genesis_file: default_genesis_file(),
        }
    }
}
impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            timeout_propose_ms: default_timeout_propose_ms(),
            timeout_propose_delta_ms: default_delta_ms(),
            timeout_prevote_ms: default_timeout_ms(),
            timeout_prevote_delta_ms: default_delta_ms(),
            timeout_precommit_ms: default_timeout_ms(),
            timeout_precommit_delta_ms: default_delta_ms(),
            timeout_commit_ms: default_timeout_ms(),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval_ms: 0,
        }
    }
}
impl Default for StorageSection {
    fn default() -> Self {
        Self {
            pruning_window: default_pruning_window(),
        }
    }
}
impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_listen_addr: default_metrics_listen(),
        }
    }
}
impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
            module_levels: None,
        }
    }
}
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            consensus: ConsensusSection::default(),
            storage: StorageSection::default(),
            observability: ObservabilitySection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            timeout_propose_ms: self.consensus.timeout_propose_ms,
            timeout_propose_delta_ms: self.consensus.timeout_propose_delta_ms,
            timeout_prevote_ms: self.consensus.timeout_prevote_ms,
            timeout_prevote_delta_ms: self.consensus.timeout_prevote_delta_ms,
            timeout_precommit_ms: self.consensus.timeout_precommit_ms,
            timeout_precommit_delta_ms: self.consensus.timeout_precommit_delta_ms,
            timeout_commit_ms: self.consensus.timeout_commit_ms,
            skip_timeout_commit: self.consensus.skip_timeout_commit,
            create_empty_blocks: self.consensus.create_empty_blocks,
            create_empty_blocks_interval_ms: self.consensus.create_empty_blocks_interval_ms,
        }
    }
}
