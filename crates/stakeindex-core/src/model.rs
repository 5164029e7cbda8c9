//! Derived application state produced by the apply loop.
//!
//! Stakes and transactions are the source of truth; the user and pool
//! aggregates are caches recomputed from them (see [`crate::aggregate`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;

/// Identity of an on-chain event: `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub tx_hash: String,
    pub log_index: u32,
}

impl EventId {
    pub fn new(tx_hash: impl Into<String>, log_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            log_index,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.log_index)
    }
}

/// A staking position opened by a `Staked` event.
///
/// Identity is the opening event's [`EventId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub owner: String,
    pub pool_id: u64,
    pub amount: TokenAmount,
    /// Opening event.
    pub opened_by: EventId,
    pub block_number: u64,
    pub staked_at: DateTime<Utc>,
    pub active: bool,
    pub unstaked_at: Option<DateTime<Utc>>,
    /// `Unstaked` event that closed this stake.
    pub closed_by: Option<EventId>,
    pub reward: TokenAmount,
    /// `true` when the position was closed without a reward.
    pub early_unstake: bool,
}

/// Closing details recorded on a stake by an `Unstaked` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeClosure {
    pub closed_by: EventId,
    pub unstaked_at: DateTime<Utc>,
    pub reward: TokenAmount,
}

impl StakeClosure {
    pub fn early_unstake(&self) -> bool {
        self.reward.is_zero()
    }
}

/// Ledger entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Stake,
    Unstake,
    Reward,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::Unstake => "unstake",
            Self::Reward => "reward",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stake" => Some(Self::Stake),
            "unstake" => Some(Self::Unstake),
            "reward" => Some(Self::Reward),
            _ => None,
        }
    }
}

/// Ledger entry status. Indexed transactions are always mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Append-only ledger entry; identity is `(event, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub owner: String,
    pub event: EventId,
    pub kind: TransactionKind,
    pub amount: TokenAmount,
    pub pool_id: Option<u64>,
    pub block_number: u64,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
}

/// A wallet seen by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub address: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Per-user totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub address: String,
    /// Σ amount of the user's active stakes.
    pub total_staked: TokenAmount,
    pub active_stakes: u64,
    pub total_stakes: u64,
    /// Σ reward transactions.
    pub total_rewards: TokenAmount,
    /// Pools with at least one active stake, ascending.
    pub active_pools: Vec<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Pool parameters from `PoolCreated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    pub pool_id: u64,
    pub min_amount: TokenAmount,
    pub max_amount: TokenAmount,
    pub apy: u64,
    pub lock_period: u64,
    pub created_block: u64,
}

/// Per-pool totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAggregate {
    pub pool_id: u64,
    /// `None` until the pool's `PoolCreated` event has been applied.
    pub params: Option<PoolParams>,
    pub total_staked: TokenAmount,
    pub active_stakes: u64,
    /// Distinct owners with an active stake.
    pub active_stakers: u64,
    pub total_rewards_distributed: TokenAmount,
    pub updated_at: DateTime<Utc>,
}

impl PoolAggregate {
    /// A freshly created pool with zeroed totals.
    pub fn empty(pool_id: u64, params: Option<PoolParams>, at: DateTime<Utc>) -> Self {
        Self {
            pool_id,
            params,
            total_staked: TokenAmount::ZERO,
            active_stakes: 0,
            active_stakers: 0,
            total_rewards_distributed: TokenAmount::ZERO,
            updated_at: at,
        }
    }
}

/// Platform-wide dashboard numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformStats {
    pub total_users: u64,
    /// Users with a non-zero active stake.
    pub total_stakers: u64,
    pub total_stakes: u64,
    pub active_stakes: u64,
    pub total_pools: u64,
    /// Σ active stakes across all pools.
    pub total_value_locked: TokenAmount,
    pub total_rewards: TokenAmount,
}

/// Convert a block timestamp to UTC, falling back to the epoch when out of range.
pub fn block_time(unix_seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0).unwrap_or_default()
}
