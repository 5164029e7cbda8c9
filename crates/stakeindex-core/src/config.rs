//! Indexer configuration, builder, and runtime state.
//!
//! # Example
//!
//! ```rust
//! use stakeindex_core::config::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .contract_address("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .deployment_block(4_200_000)
//!     .chunk_size(500)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.chunk_size, 500);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (cursor key).
    pub id: String,
    /// Staking contract to watch.
    pub contract_address: String,
    /// First block of the historical range.
    pub deployment_block: u64,
    /// Blocks per `eth_getLogs` chunk.
    pub chunk_size: u64,
    /// Fetch loop tick (milliseconds).
    pub fetch_interval_ms: u64,
    /// Apply loop tick (milliseconds).
    pub apply_interval_ms: u64,
    /// Events applied per apply tick.
    pub apply_batch_size: usize,
    /// Catch up and drain before starting the timers.
    pub bootstrap: bool,
    /// Upper bound on a single chain client call (milliseconds).
    pub rpc_timeout_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "staking".into(),
            contract_address: String::new(),
            deployment_block: 0,
            chunk_size: 1000,
            fetch_interval_ms: 30_000,
            apply_interval_ms: 60_000,
            apply_batch_size: 50,
            bootstrap: true,
            rpc_timeout_ms: 15_000,
        }
    }
}

impl IndexerConfig {
    /// Reject configurations the indexer cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let addr = self.contract_address.trim_start_matches("0x");
        if addr.len() != 40 || !addr.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IndexerError::Config(format!(
                "contract_address must be a 20-byte hex address, got {:?}",
                self.contract_address
            )));
        }
        if self.chunk_size == 0 {
            return Err(IndexerError::Config("chunk_size must be > 0".into()));
        }
        if self.apply_batch_size == 0 {
            return Err(IndexerError::Config("apply_batch_size must be > 0".into()));
        }
        if self.fetch_interval_ms == 0 || self.apply_interval_ms == 0 {
            return Err(IndexerError::Config("tick intervals must be > 0".into()));
        }
        if self.id.is_empty() {
            return Err(IndexerError::Config("id must not be empty".into()));
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn apply_interval(&self) -> Duration {
        Duration::from_millis(self.apply_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Fluent builder for [`IndexerConfig`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the indexer ID (used as the cursor key).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the staking contract address.
    pub fn contract_address(mut self, address: impl Into<String>) -> Self {
        self.config.contract_address = address.into();
        self
    }

    /// Set the contract's deployment block.
    pub fn deployment_block(mut self, block: u64) -> Self {
        self.config.deployment_block = block;
        self
    }

    /// Set the number of blocks per fetch chunk.
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn fetch_interval_ms(mut self, ms: u64) -> Self {
        self.config.fetch_interval_ms = ms;
        self
    }

    pub fn apply_interval_ms(mut self, ms: u64) -> Self {
        self.config.apply_interval_ms = ms;
        self
    }

    pub fn apply_batch_size(mut self, n: usize) -> Self {
        self.config.apply_batch_size = n;
        self
    }

    /// Enable or disable the startup catch-up pass.
    pub fn bootstrap(mut self, enabled: bool) -> Self {
        self.config.bootstrap = enabled;
        self
    }

    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    /// Build without validation.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build and validate.
    pub fn build(self) -> Result<IndexerConfig, IndexerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Running the startup catch-up.
    Backfilling,
    /// Periodic loops are running.
    Live,
    /// Shutting down; in-flight ticks are finishing.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
