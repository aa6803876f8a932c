//! Configuration management for KernelChain

use crate::error::{ChainError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub consensus: ConsensusConfig,
    pub daemons: DaemonConfig,
    pub ban: BanConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex-encoded secp256k1 secret key of this node.
    pub private_key: String,
    /// Address other nodes use to reach this one; excluded from sync hosts.
    pub tcp_address: String,
    pub key_id: i64,
    pub ecosystem_id: u64,
    pub block_version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            tcp_address: "127.0.0.1:7078".to_string(),
            key_id: 0,
            ecosystem_id: 1,
            block_version: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HonorNode {
    pub tcp_address: String,
    /// Hex-encoded compressed public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bootstrap_nodes: Vec<String>,
    pub honor_nodes: Vec<HonorNode>,
    /// Upper bound for every single-peer request.
    #[serde(with = "human_duration")]
    pub peer_timeout: Duration,
    pub blocks_per_request: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            honor_nodes: Vec::new(),
            peer_timeout: Duration::from_secs(2),
            blocks_per_request: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Hex public key that signed the first block; sole producer while the
    /// candidate registry is empty in candidate mode.
    pub first_block_public_key: String,
    /// Unix seconds of the first block; origin of the block-slot schedule.
    pub first_block_time: i64,
    #[serde(with = "human_duration")]
    pub block_generation_time: Duration,
    #[serde(with = "human_duration")]
    pub blocks_gap: Duration,
    pub max_tx_per_block: usize,
    /// Maximum number of blocks a fork repair may replace.
    pub rollback_blocks: usize,
    #[serde(with = "human_duration")]
    pub candidate_backoff: Duration,
    pub min_confirmed_nodes: usize,
    /// Signed votes and voting totals older than this are discarded.
    #[serde(with = "human_duration")]
    pub vote_max_age: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            first_block_public_key: String::new(),
            first_block_time: 0,
            block_generation_time: Duration::from_secs(2),
            blocks_gap: Duration::from_secs(4),
            max_tx_per_block: 1000,
            rollback_blocks: 60,
            candidate_backoff: Duration::from_secs(4),
            min_confirmed_nodes: 3,
            vote_max_age: Duration::from_secs(120),
        }
    }
}

/// Initial sleep interval of each daemon job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(with = "human_duration")]
    pub block_generator: Duration,
    #[serde(with = "human_duration")]
    pub blocks_collection: Duration,
    #[serde(with = "human_duration")]
    pub candidate_voting: Duration,
    #[serde(with = "human_duration")]
    pub confirmations: Duration,
    #[serde(with = "human_duration")]
    pub install_poll: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            block_generator: Duration::from_secs(1),
            blocks_collection: Duration::from_secs(5),
            candidate_voting: Duration::from_secs(60),
            confirmations: Duration::from_secs(1),
            install_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BanConfig {
    #[serde(with = "human_duration")]
    pub local_ban_time: Duration,
    #[serde(with = "human_duration")]
    pub max_ban_time: Duration,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            local_ban_time: Duration::from_secs(30 * 60),
            max_ban_time: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Durations are written as human readable strings ("10s", "1m 30s").
mod human_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Load configuration from `path`, falling back to defaults when the file is
/// absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.node.private_key.is_empty() {
            return Err(ChainError::ConfigError(
                "node.private_key must be set".to_string(),
            ));
        }
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError(
                "database.path must be set".to_string(),
            ));
        }
        if self.consensus.rollback_blocks < 2 {
            return Err(ChainError::ConfigError(
                "consensus.rollback_blocks must be at least 2".to_string(),
            ));
        }
        let d = &self.daemons;
        for (name, interval) in [
            ("block_generator", d.block_generator),
            ("blocks_collection", d.blocks_collection),
            ("candidate_voting", d.candidate_voting),
            ("confirmations", d.confirmations),
            ("install_poll", d.install_poll),
        ] {
            if interval.is_zero() {
                return Err(ChainError::ConfigError(format!(
                    "daemons.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn default_data_dir() -> String {
    "./data/chain.db".to_string()
}
