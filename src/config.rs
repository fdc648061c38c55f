use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub const DEFAULT_WITHDRAWAL_EPOCH_LENGTH: u32 = 100;
pub const DEFAULT_SLOTS_PER_EPOCH: u32 = 720;
pub const DEFAULT_SLOT_DURATION_SECS: u64 = 120;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_max_rollback_versions")]
    pub max_rollback_versions: usize,
    #[serde(default = "default_mempool_limit")]
    pub mempool_limit: usize,
    pub params: ChainParams,
}

fn default_max_rollback_versions() -> usize {
    720
}

fn default_mempool_limit() -> usize {
    8_192
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_rollback_versions: default_max_rollback_versions(),
            mempool_limit: default_mempool_limit(),
            params: ChainParams::default(),
        }
    }
}

/// Consensus-critical chain constants shared by state, history and wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainParams {
    pub withdrawal_epoch_length: u32,
    pub consensus_slots_per_epoch: u32,
    pub consensus_slot_duration_secs: u64,
    pub genesis_timestamp: u64,
}

impl ChainParams {
    pub fn consensus_epoch_for_timestamp(&self, timestamp: u64) -> u32 {
        if timestamp <= self.genesis_timestamp {
            return 1;
        }
        let slot = (timestamp - self.genesis_timestamp) / self.consensus_slot_duration_secs.max(1);
        (slot / self.consensus_slots_per_epoch.max(1) as u64) as u32 + 1
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            withdrawal_epoch_length: DEFAULT_WITHDRAWAL_EPOCH_LENGTH,
            consensus_slots_per_epoch: DEFAULT_SLOTS_PER_EPOCH,
            consensus_slot_duration_secs: DEFAULT_SLOT_DURATION_SECS,
            genesis_timestamp: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_epoch_advances_by_slots() {
        let params = ChainParams {
            withdrawal_epoch_length: 10,
            consensus_slots_per_epoch: 4,
            consensus_slot_duration_secs: 10,
            genesis_timestamp: 1_000,
        };
        assert_eq!(params.consensus_epoch_for_timestamp(1_000), 1);
        assert_eq!(params.consensus_epoch_for_timestamp(1_030), 1);
        assert_eq!(params.consensus_epoch_for_timestamp(1_040), 2);
        assert_eq!(params.consensus_epoch_for_timestamp(1_079), 2);
        assert_eq!(params.consensus_epoch_for_timestamp(1_120), 4);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: NodeConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.max_rollback_versions, config.max_rollback_versions);
        assert_eq!(
            decoded.params.withdrawal_epoch_length,
            config.params.withdrawal_epoch_length
        );
    }
}
