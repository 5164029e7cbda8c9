//! Daemon configuration: optional YAML file, then environment overrides.
//!
//! ```yaml
//! rpc_url: http://127.0.0.1:8545
//! database_url: ./stakeindex.db
//! indexer:
//!   contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
//!   deployment_block: 4200000
//!   chunk_size: 1000
//! log:
//!   level: info
//!   json: true
//! ```
//!
//! | Variable                   | Field                        |
//! |----------------------------|------------------------------|
//! | `RPC_URL`                  | `rpc_url`                    |
//! | `STAKING_CONTRACT_ADDRESS` | `indexer.contract_address`   |
//! | `DEPLOYMENT_BLOCK`         | `indexer.deployment_block`   |
//! | `DATABASE_URL`             | `database_url`               |
//! | `LOG_LEVEL`                | `log.level`                  |

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use stakeindex_core::config::IndexerConfig;

use crate::logging::LogConfig;

/// `database_url` value selecting the non-persistent in-memory store.
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// JSON-RPC endpoint of the chain node.
    pub rpc_url: String,
    /// SQLite path or URL, or `"memory"`.
    pub database_url: String,
    /// Capacity of the notification broadcast channel.
    pub notify_capacity: usize,
    pub indexer: IndexerConfig,
    pub log: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            database_url: "./stakeindex.db".into(),
            notify_capacity: 256,
            indexer: IndexerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `path` (if given), then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from environment variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("RPC_URL") {
            self.rpc_url = url;
        }
        if let Some(address) = var("STAKING_CONTRACT_ADDRESS") {
            self.indexer.contract_address = address;
        }
        if let Some(block) = var("DEPLOYMENT_BLOCK") {
            self.indexer.deployment_block = block
                .trim()
                .parse()
                .with_context(|| format!("DEPLOYMENT_BLOCK is not a block number: {block:?}"))?;
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE
    }
}
