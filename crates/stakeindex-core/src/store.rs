//! Persistence traits.
//!
//! The indexer owns three kinds of state: the staged event log, the fetch
//! cursor, and the derived staking tables. Backends in `stakeindex-storage`
//! implement all of them; [`IndexerStore`] names the combination.
//!
//! Write ownership is split by construction: only the fetch loop calls
//! [`EventLogStore::append`] and [`CursorStore::advance`]; only the apply loop
//! marks events processed and writes through [`StakingStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IndexerError;
use crate::model::{
    EventId, PlatformStats, PoolAggregate, PoolParams, Stake, StakeClosure, Transaction,
    UserAggregate,
};
use crate::types::{AppendOutcome, RawEvent, StagedEvent};

/// Append-only log of observed chain events.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Upsert keyed by `(tx_hash, log_index)`.
    ///
    /// An identical re-observation is a no-op. A re-observation with different
    /// content rewrites the row and resets it to unprocessed.
    async fn append(&self, event: RawEvent) -> Result<AppendOutcome, IndexerError>;

    /// Unprocessed events ordered by `(block_number, log_index)` ascending.
    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagedEvent>, IndexerError>;

    async fn mark_processed(&self, id: i64) -> Result<(), IndexerError>;

    /// Mark processed with a warning; used for events that cannot be applied.
    async fn mark_skipped(&self, id: i64, reason: &str) -> Result<(), IndexerError>;

    async fn unprocessed_count(&self) -> Result<u64, IndexerError>;

    async fn total_count(&self) -> Result<u64, IndexerError>;

    /// Highest block number among processed events (0 if none).
    async fn last_processed_block(&self) -> Result<u64, IndexerError>;
}

/// Durable fetch watermark, keyed by indexer id.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Highest block whose events are fully staged, or `None` on first run.
    async fn load(&self, indexer_id: &str) -> Result<Option<u64>, IndexerError>;

    /// Raise the watermark to `block`. Never lowers a stored value.
    async fn advance(&self, indexer_id: &str, block: u64) -> Result<(), IndexerError>;
}

/// Write side of the derived staking tables.
///
/// Every write is keyed on an event's natural identity, so replaying a
/// handler leaves the tables unchanged.
#[async_trait]
pub trait StakingStore: Send + Sync {
    /// Create the user row if absent. Returns `true` if it was created.
    async fn ensure_user(&self, address: &str, at: DateTime<Utc>) -> Result<bool, IndexerError>;

    /// Insert a stake if no stake with the same `opened_by` exists.
    async fn insert_stake(&self, stake: &Stake) -> Result<bool, IndexerError>;

    /// The stake closed by the given `Unstaked` event, if any.
    async fn stake_closed_by(&self, event: &EventId) -> Result<Option<Stake>, IndexerError>;

    /// All active stakes of `owner` in `pool_id`, oldest first.
    async fn active_stakes_in_pool(
        &self,
        owner: &str,
        pool_id: u64,
    ) -> Result<Vec<Stake>, IndexerError>;

    /// Close the stake opened by `opened_by` if it is still active.
    /// Returns `true` if a row changed.
    async fn close_stake(
        &self,
        opened_by: &EventId,
        closure: &StakeClosure,
    ) -> Result<bool, IndexerError>;

    /// Insert a ledger entry if `(event, kind)` is not present yet.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, IndexerError>;

    /// Register a pool with zeroed totals. Fills in missing parameters on an
    /// existing row but never resets its totals. Returns `true` if the row was
    /// created or its parameters were filled in.
    async fn ensure_pool(&self, params: &PoolParams, at: DateTime<Utc>)
        -> Result<bool, IndexerError>;

    /// Recompute and persist the user's aggregate from stake/transaction rows.
    async fn refresh_user_aggregate(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<UserAggregate, IndexerError>;

    /// Recompute and persist the pool's aggregate from stake rows.
    async fn refresh_pool_aggregate(
        &self,
        pool_id: u64,
        at: DateTime<Utc>,
    ) -> Result<PoolAggregate, IndexerError>;
}

/// Read-only queries for the API layer.
#[async_trait]
pub trait StakingReader: Send + Sync {
    async fn user_aggregate(&self, address: &str) -> Result<Option<UserAggregate>, IndexerError>;

    async fn pool_aggregate(&self, pool_id: u64) -> Result<Option<PoolAggregate>, IndexerError>;

    /// Every known pool, by id.
    async fn pools(&self) -> Result<Vec<PoolAggregate>, IndexerError>;

    /// Active stakes of a user, newest first.
    async fn active_stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError>;

    /// Every stake of a user (active and closed), newest first.
    async fn stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError>;

    /// Latest ledger entries, newest first, optionally for one owner.
    async fn recent_transactions(
        &self,
        limit: usize,
        owner: Option<&str>,
    ) -> Result<Vec<Transaction>, IndexerError>;

    /// Users ranked by `total_staked` descending, zero balances omitted.
    async fn top_stakers(&self, limit: usize) -> Result<Vec<UserAggregate>, IndexerError>;

    async fn platform_stats(&self) -> Result<PlatformStats, IndexerError>;
}

/// A backend implementing every store the indexer needs.
pub trait IndexerStore: EventLogStore + CursorStore + StakingStore + StakingReader {}

impl<T> IndexerStore for T where T: EventLogStore + CursorStore + StakingStore + StakingReader {}
