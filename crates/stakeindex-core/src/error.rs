//! Error types for the staking indexer pipeline.

use thiserror::Error;

/// Errors that can occur while fetching, staging or applying events.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed event {tx_hash}#{log_index}: {reason}")]
    MalformedEvent {
        tx_hash: String,
        log_index: u32,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the failure is worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Timeout { .. } | Self::Storage(_))
    }

    /// Returns `true` if the event itself is bad and retrying cannot help.
    pub fn is_data_anomaly(&self) -> bool {
        matches!(self, Self::MalformedEvent { .. })
    }
}
