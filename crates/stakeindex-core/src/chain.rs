//! Chain client abstraction.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{EventKind, RawEvent};

/// Read access to the staking contract's event history.
///
/// Implementations must:
/// - return events ordered by `(block_number, log_index)` ascending;
/// - return an empty vec when `from > to` or `from` is beyond the head;
/// - report network failures as transient errors
///   ([`IndexerError::Rpc`] / [`IndexerError::Timeout`]).
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn current_height(&self) -> Result<u64, IndexerError>;

    /// Events of `kind` emitted by the tracked contract in `[from, to]`.
    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, IndexerError>;
}
