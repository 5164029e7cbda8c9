//! Aggregate math.
//!
//! Aggregates are always recomputed from stake and transaction rows, never
//! incremented, so applying the same event twice leaves them unchanged.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::amount::TokenAmount;
use crate::model::{
    PlatformStats, PoolAggregate, PoolParams, Stake, Transaction, TransactionKind, UserAggregate,
};

/// Recompute a user's totals from their stakes and ledger entries.
///
/// Rows belonging to other owners are ignored.
pub fn user_aggregate(
    address: &str,
    stakes: &[Stake],
    transactions: &[Transaction],
    at: DateTime<Utc>,
) -> UserAggregate {
    let own: Vec<&Stake> = stakes.iter().filter(|s| s.owner == address).collect();
    let active: Vec<&&Stake> = own.iter().filter(|s| s.active).collect();

    let active_pools: BTreeSet<u64> = active.iter().map(|s| s.pool_id).collect();

    UserAggregate {
        address: address.to_string(),
        total_staked: active.iter().map(|s| s.amount).sum(),
        active_stakes: active.len() as u64,
        total_stakes: own.len() as u64,
        total_rewards: transactions
            .iter()
            .filter(|t| t.owner == address && t.kind == TransactionKind::Reward)
            .map(|t| t.amount)
            .sum(),
        active_pools: active_pools.into_iter().collect(),
        updated_at: at,
    }
}

/// Recompute a pool's totals from its stakes.
pub fn pool_aggregate(
    pool_id: u64,
    params: Option<PoolParams>,
    stakes: &[Stake],
    at: DateTime<Utc>,
) -> PoolAggregate {
    let in_pool: Vec<&Stake> = stakes.iter().filter(|s| s.pool_id == pool_id).collect();
    let active: Vec<&&Stake> = in_pool.iter().filter(|s| s.active).collect();
    let stakers: BTreeSet<&str> = active.iter().map(|s| s.owner.as_str()).collect();

    PoolAggregate {
        pool_id,
        params,
        total_staked: active.iter().map(|s| s.amount).sum(),
        active_stakes: active.len() as u64,
        active_stakers: stakers.len() as u64,
        total_rewards_distributed: in_pool.iter().map(|s| s.reward).sum(),
        updated_at: at,
    }
}

/// Platform-wide numbers over every stake and ledger entry.
pub fn platform_stats(
    total_users: u64,
    total_pools: u64,
    stakes: &[Stake],
    transactions: &[Transaction],
) -> PlatformStats {
    let active: Vec<&Stake> = stakes.iter().filter(|s| s.active).collect();
    let stakers: BTreeSet<&str> = active
        .iter()
        .filter(|s| !s.amount.is_zero())
        .map(|s| s.owner.as_str())
        .collect();

    PlatformStats {
        total_users,
        total_stakers: stakers.len() as u64,
        total_stakes: stakes.len() as u64,
        active_stakes: active.len() as u64,
        total_pools,
        total_value_locked: active.iter().map(|s| s.amount).sum(),
        total_rewards: transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Reward)
            .map(|t| t.amount)
            .sum::<TokenAmount>(),
    }
}

/// Order users for the leaderboard: highest `total_staked` first, address as
/// tie-breaker, users with nothing staked dropped.
pub fn rank_stakers(mut users: Vec<UserAggregate>, limit: usize) -> Vec<UserAggregate> {
    users.retain(|u| !u.total_staked.is_zero());
    users.sort_by(|a, b| {
        b.total_staked
            .cmp(&a.total_staked)
            .then_with(|| a.address.cmp(&b.address))
    });
    users.truncate(limit);
    users
}
