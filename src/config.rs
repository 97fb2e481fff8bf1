//! Configuration file support for the braid node.
//!
//! Loads optional `braid.toml` from the data directory. If no config file
//! exists, defaults from `crate::constants` are used.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BraidConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusParams,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./braid-data".into(),
            max_peers: 64,
        }
    }
}

/// Consensus parameters.
///
/// These shape admission, fork pruning, flushing, and sync batching; all
/// nodes of a network must agree on them.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub punctuality_threshold: u64,
    pub delete_fork_threshold: usize,
    pub sync_task_timeout_secs: u64,
    pub max_get_data_size: usize,
    pub max_get_inv_length: usize,
    pub max_inventory_size: usize,
    pub obc_enable_threshold_secs: u64,
    pub sortition_threshold: u64,
    pub sortition_coefficient: u64,
    pub target_milestone_spacing_secs: u64,
    pub milestone_target_shift: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            punctuality_threshold: constants::PUNCTUALITY_THRESHOLD,
            delete_fork_threshold: constants::DELETE_FORK_THRESHOLD,
            sync_task_timeout_secs: constants::SYNC_TASK_TIMEOUT_SECS,
            max_get_data_size: constants::MAX_GET_DATA_SIZE,
            max_get_inv_length: constants::MAX_GET_INV_LENGTH,
            max_inventory_size: constants::MAX_INVENTORY_SIZE,
            obc_enable_threshold_secs: constants::OBC_ENABLE_THRESHOLD_SECS,
            sortition_threshold: constants::SORTITION_THRESHOLD,
            sortition_coefficient: constants::SORTITION_COEFFICIENT,
            target_milestone_spacing_secs: constants::TARGET_MILESTONE_SPACING_SECS,
            milestone_target_shift: constants::MILESTONE_TARGET_SHIFT,
        }
    }
}

impl ConsensusParams {
    pub fn sync_task_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_task_timeout_secs)
    }
}

impl BraidConfig {
    /// Load configuration from `braid.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("braid.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = BraidConfig::default();
        assert_eq!(
            config.consensus.punctuality_threshold,
            constants::PUNCTUALITY_THRESHOLD
        );
        assert_eq!(config.node.max_peers, 64);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[node]
data_dir = "/var/lib/braid"

[consensus]
punctuality_threshold = 4
delete_fork_threshold = 2
"#;
        let config: BraidConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.data_dir, "/var/lib/braid");
        assert_eq!(config.consensus.punctuality_threshold, 4);
        assert_eq!(config.consensus.delete_fork_threshold, 2);
        // Unspecified fields fall back to constants.
        assert_eq!(
            config.consensus.max_get_data_size,
            constants::MAX_GET_DATA_SIZE
        );
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BraidConfig::load(dir.path());
        assert_eq!(
            config.consensus.punctuality_threshold,
            constants::PUNCTUALITY_THRESHOLD
        );
    }
}
