//! In-memory storage backend.
//!
//! Holds the event log, cursors and staking tables in RAM behind a single
//! lock. Useful for tests and throwaway runs; all data is lost on exit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stakeindex_core::aggregate;
use stakeindex_core::error::IndexerError;
use stakeindex_core::model::{
    EventId, PlatformStats, PoolAggregate, PoolParams, Stake, StakeClosure, Transaction,
    TransactionKind, User, UserAggregate,
};
use stakeindex_core::store::{CursorStore, EventLogStore, StakingReader, StakingStore};
use stakeindex_core::types::{AppendOutcome, RawEvent, StagedEvent};

#[derive(Default)]
struct State {
    /// Row id is `index + 1`.
    events: Vec<StagedEvent>,
    event_keys: HashMap<(String, u32), usize>,
    cursors: HashMap<String, u64>,
    users: BTreeMap<String, User>,
    stakes: Vec<Stake>,
    stake_keys: HashMap<EventId, usize>,
    transactions: Vec<Transaction>,
    transaction_keys: HashSet<(EventId, TransactionKind)>,
    user_aggregates: HashMap<String, UserAggregate>,
    pools: BTreeMap<u64, PoolAggregate>,
}

impl State {
    fn event_mut(&mut self, id: i64) -> Result<&mut StagedEvent, IndexerError> {
        usize::try_from(id)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.events.get_mut(i))
            .ok_or_else(|| IndexerError::Storage(format!("no staged event with id {id}")))
    }
}

/// In-memory indexer storage.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, IndexerError> {
        self.state
            .lock()
            .map_err(|_| IndexerError::Storage("in-memory store lock poisoned".into()))
    }

    /// Every staged event in insertion order, processed or not.
    pub fn staged_events(&self) -> Result<Vec<StagedEvent>, IndexerError> {
        Ok(self.state()?.events.clone())
    }

    /// Every ledger entry in insertion order.
    pub fn transactions(&self) -> Result<Vec<Transaction>, IndexerError> {
        Ok(self.state()?.transactions.clone())
    }
}

fn newest_first<T>(rows: &mut [T], key: impl Fn(&T) -> (u64, u32)) {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
}

// ─── EventLogStore ───────────────────────────────────────────────────────────

#[async_trait]
impl EventLogStore for InMemoryStorage {
    async fn append(&self, event: RawEvent) -> Result<AppendOutcome, IndexerError> {
        let mut state = self.state()?;
        let key = (event.tx_hash.clone(), event.log_index);

        if let Some(&idx) = state.event_keys.get(&key) {
            let staged = &mut state.events[idx];
            if staged.event == event {
                return Ok(AppendOutcome::Unchanged);
            }
            staged.event = event;
            staged.processed = false;
            staged.note = None;
            return Ok(AppendOutcome::Updated);
        }

        let idx = state.events.len();
        state.events.push(StagedEvent {
            id: idx as i64 + 1,
            event,
            processed: false,
            note: None,
        });
        state.event_keys.insert(key, idx);
        Ok(AppendOutcome::Inserted)
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagedEvent>, IndexerError> {
        let state = self.state()?;
        let mut pending: Vec<StagedEvent> = state
            .events
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.event.position());
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&self, id: i64) -> Result<(), IndexerError> {
        self.state()?.event_mut(id)?.processed = true;
        Ok(())
    }

    async fn mark_skipped(&self, id: i64, reason: &str) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        let staged = state.event_mut(id)?;
        staged.processed = true;
        staged.note = Some(reason.to_string());
        Ok(())
    }

    async fn unprocessed_count(&self) -> Result<u64, IndexerError> {
        Ok(self.state()?.events.iter().filter(|e| !e.processed).count() as u64)
    }

    async fn total_count(&self) -> Result<u64, IndexerError> {
        Ok(self.state()?.events.len() as u64)
    }

    async fn last_processed_block(&self) -> Result<u64, IndexerError> {
        Ok(self
            .state()?
            .events
            .iter()
            .filter(|e| e.processed)
            .map(|e| e.event.block_number)
            .max()
            .unwrap_or(0))
    }
}

// ─── CursorStore ─────────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for InMemoryStorage {
    async fn load(&self, indexer_id: &str) -> Result<Option<u64>, IndexerError> {
        Ok(self.state()?.cursors.get(indexer_id).copied())
    }

    async fn advance(&self, indexer_id: &str, block: u64) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        let entry = state.cursors.entry(indexer_id.to_string()).or_insert(block);
        *entry = (*entry).max(block);
        Ok(())
    }
}

// ─── StakingStore ────────────────────────────────────────────────────────────

#[async_trait]
impl StakingStore for InMemoryStorage {
    async fn ensure_user(&self, address: &str, at: DateTime<Utc>) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        if state.users.contains_key(address) {
            return Ok(false);
        }
        state.users.insert(
            address.to_string(),
            User {
                address: address.to_string(),
                first_seen_at: at,
            },
        );
        Ok(true)
    }

    async fn insert_stake(&self, stake: &Stake) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        if state.stake_keys.contains_key(&stake.opened_by) {
            return Ok(false);
        }
        let idx = state.stakes.len();
        state.stakes.push(stake.clone());
        state.stake_keys.insert(stake.opened_by.clone(), idx);
        Ok(true)
    }

    async fn stake_closed_by(&self, event: &EventId) -> Result<Option<Stake>, IndexerError> {
        Ok(self
            .state()?
            .stakes
            .iter()
            .find(|s| s.closed_by.as_ref() == Some(event))
            .cloned())
    }

    async fn active_stakes_in_pool(
        &self,
        owner: &str,
        pool_id: u64,
    ) -> Result<Vec<Stake>, IndexerError> {
        let state = self.state()?;
        let mut stakes: Vec<Stake> = state
            .stakes
            .iter()
            .filter(|s| s.active && s.owner == owner && s.pool_id == pool_id)
            .cloned()
            .collect();
        stakes.sort_by_key(|s| (s.block_number, s.opened_by.log_index));
        Ok(stakes)
    }

    async fn close_stake(
        &self,
        opened_by: &EventId,
        closure: &StakeClosure,
    ) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        let Some(&idx) = state.stake_keys.get(opened_by) else {
            return Ok(false);
        };
        let stake = &mut state.stakes[idx];
        if !stake.active {
            return Ok(false);
        }
        stake.active = false;
        stake.unstaked_at = Some(closure.unstaked_at);
        stake.closed_by = Some(closure.closed_by.clone());
        stake.reward = closure.reward;
        stake.early_unstake = closure.early_unstake();
        Ok(true)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        if !state.transaction_keys.insert((tx.event.clone(), tx.kind)) {
            return Ok(false);
        }
        state.transactions.push(tx.clone());
        Ok(true)
    }

    async fn ensure_pool(
        &self,
        params: &PoolParams,
        at: DateTime<Utc>,
    ) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        if let Some(pool) = state.pools.get_mut(&params.pool_id) {
            if pool.params.is_some() {
                return Ok(false);
            }
            pool.params = Some(params.clone());
            pool.updated_at = at;
            return Ok(true);
        }
        state.pools.insert(
            params.pool_id,
            PoolAggregate::empty(params.pool_id, Some(params.clone()), at),
        );
        Ok(true)
    }

    async fn refresh_user_aggregate(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<UserAggregate, IndexerError> {
        let mut state = self.state()?;
        let agg = aggregate::user_aggregate(address, &state.stakes, &state.transactions, at);
        state
            .user_aggregates
            .insert(address.to_string(), agg.clone());
        Ok(agg)
    }

    async fn refresh_pool_aggregate(
        &self,
        pool_id: u64,
        at: DateTime<Utc>,
    ) -> Result<PoolAggregate, IndexerError> {
        let mut state = self.state()?;
        let params = state.pools.get(&pool_id).and_then(|p| p.params.clone());
        let agg = aggregate::pool_aggregate(pool_id, params, &state.stakes, at);
        state.pools.insert(pool_id, agg.clone());
        Ok(agg)
    }
}

// ─── StakingReader ───────────────────────────────────────────────────────────

#[async_trait]
impl StakingReader for InMemoryStorage {
    async fn user_aggregate(&self, address: &str) -> Result<Option<UserAggregate>, IndexerError> {
        Ok(self.state()?.user_aggregates.get(address).cloned())
    }

    async fn pool_aggregate(&self, pool_id: u64) -> Result<Option<PoolAggregate>, IndexerError> {
        Ok(self.state()?.pools.get(&pool_id).cloned())
    }

    async fn pools(&self) -> Result<Vec<PoolAggregate>, IndexerError> {
        Ok(self.state()?.pools.values().cloned().collect())
    }

    async fn active_stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError> {
        let mut stakes: Vec<Stake> = self
            .state()?
            .stakes
            .iter()
            .filter(|s| s.active && s.owner == owner)
            .cloned()
            .collect();
        newest_first(&mut stakes, |s| (s.block_number, s.opened_by.log_index));
        Ok(stakes)
    }

    async fn stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError> {
        let mut stakes: Vec<Stake> = self
            .state()?
            .stakes
            .iter()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect();
        newest_first(&mut stakes, |s| (s.block_number, s.opened_by.log_index));
        Ok(stakes)
    }

    async fn recent_transactions(
        &self,
        limit: usize,
        owner: Option<&str>,
    ) -> Result<Vec<Transaction>, IndexerError> {
        let mut txs: Vec<Transaction> = self
            .state()?
            .transactions
            .iter()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .cloned()
            .collect();
        newest_first(&mut txs, |t| (t.block_number, t.event.log_index));
        txs.truncate(limit);
        Ok(txs)
    }

    async fn top_stakers(&self, limit: usize) -> Result<Vec<UserAggregate>, IndexerError> {
        let users = self.state()?.user_aggregates.values().cloned().collect();
        Ok(aggregate::rank_stakers(users, limit))
    }

    async fn platform_stats(&self) -> Result<PlatformStats, IndexerError> {
        let state = self.state()?;
        Ok(aggregate::platform_stats(
            state.users.len() as u64,
            state.pools.len() as u64,
            &state.stakes,
            &state.transactions,
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use stakeindex_core::amount::TokenAmount;
    use stakeindex_core::model::TransactionStatus;
    use stakeindex_core::types::EventKind;

    fn raw(tx: &str, block: u64, log_index: u32) -> RawEvent {
        RawEvent {
            kind: EventKind::Staked,
            contract_address: "0xcc".into(),
            tx_hash: tx.into(),
            block_number: block,
            block_hash: format!("0xb{block}"),
            log_index,
            block_timestamp: 1_700_000_000 + block as i64,
            payload: serde_json::json!({
                "user": "0x1111111111111111111111111111111111111111",
                "poolId": "1",
                "amount": "1000"
            }),
        }
    }

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn stake(owner: &str, tx: &str, block: u64, amount: u128) -> Stake {
        Stake {
            owner: owner.into(),
            pool_id: 1,
            amount: TokenAmount::from_u128(amount),
            opened_by: EventId::new(tx, 0),
            block_number: block,
            staked_at: at(),
            active: true,
            unstaked_at: None,
            closed_by: None,
            reward: TokenAmount::ZERO,
            early_unstake: false,
        }
    }

    #[tokio::test]
    async fn append_is_an_upsert() {
        let store = InMemoryStorage::new();
        let e = raw("0xa", 10, 0);

        assert_eq!(store.append(e.clone()).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(store.append(e.clone()).await.unwrap(), AppendOutcome::Unchanged);
        assert_eq!(store.total_count().await.unwrap(), 1);

        let id = store.list_unprocessed(10).await.unwrap()[0].id;
        store.mark_processed(id).await.unwrap();

        let mut changed = e;
        changed.block_hash = "0xother".into();
        assert_eq!(store.append(changed).await.unwrap(), AppendOutcome::Updated);
        assert_eq!(store.total_count().await.unwrap(), 1);
        assert_eq!(store.unprocessed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unprocessed_listed_in_chain_order() {
        let store = InMemoryStorage::new();
        store.append(raw("0xc", 20, 1)).await.unwrap();
        store.append(raw("0xa", 10, 5)).await.unwrap();
        store.append(raw("0xb", 20, 0)).await.unwrap();

        let listed = store.list_unprocessed(10).await.unwrap();
        let positions: Vec<_> = listed.iter().map(|e| e.event.position()).collect();
        assert_eq!(positions, vec![(10, 5), (20, 0), (20, 1)]);

        let limited = store.list_unprocessed(2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn skipped_events_count_as_processed() {
        let store = InMemoryStorage::new();
        store.append(raw("0xa", 10, 0)).await.unwrap();
        store.append(raw("0xb", 30, 0)).await.unwrap();
        let listed = store.list_unprocessed(10).await.unwrap();

        store.mark_skipped(listed[1].id, "bad payload").await.unwrap();
        assert_eq!(store.unprocessed_count().await.unwrap(), 1);
        assert_eq!(store.last_processed_block().await.unwrap(), 30);

        let all = store.staged_events().unwrap();
        assert_eq!(all[1].note.as_deref(), Some("bad payload"));
    }

    #[tokio::test]
    async fn mark_unknown_id_errors() {
        let store = InMemoryStorage::new();
        assert!(store.mark_processed(42).await.is_err());
        assert!(store.mark_processed(0).await.is_err());
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = InMemoryStorage::new();
        assert_eq!(store.load("staking").await.unwrap(), None);
        store.advance("staking", 500).await.unwrap();
        store.advance("staking", 300).await.unwrap();
        assert_eq!(store.load("staking").await.unwrap(), Some(500));
        assert_eq!(store.load("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stake_writes_are_keyed_by_event() {
        let store = InMemoryStorage::new();
        let s = stake("0xaa", "0xs1", 10, 1000);
        assert!(store.insert_stake(&s).await.unwrap());
        assert!(!store.insert_stake(&s).await.unwrap());

        let closure = StakeClosure {
            closed_by: EventId::new("0xu1", 3),
            unstaked_at: at(),
            reward: TokenAmount::ZERO,
        };
        assert!(store.close_stake(&s.opened_by, &closure).await.unwrap());
        assert!(!store.close_stake(&s.opened_by, &closure).await.unwrap());

        let closed = store
            .stake_closed_by(&EventId::new("0xu1", 3))
            .await
            .unwrap()
            .unwrap();
        assert!(!closed.active);
        assert!(closed.early_unstake);
        assert!(store.active_stakes("0xaa").await.unwrap().is_empty());
        assert_eq!(store.stakes("0xaa").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transactions_unique_per_event_and_kind() {
        let store = InMemoryStorage::new();
        let tx = Transaction {
            owner: "0xaa".into(),
            event: EventId::new("0xu1", 0),
            kind: TransactionKind::Unstake,
            amount: TokenAmount::from_u128(10),
            pool_id: Some(1),
            block_number: 5,
            status: TransactionStatus::Confirmed,
            timestamp: at(),
        };
        assert!(store.insert_transaction(&tx).await.unwrap());
        assert!(!store.insert_transaction(&tx).await.unwrap());

        let reward = Transaction {
            kind: TransactionKind::Reward,
            ..tx
        };
        assert!(store.insert_transaction(&reward).await.unwrap());
        assert_eq!(store.transactions().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ensure_pool_keeps_totals() {
        let store = InMemoryStorage::new();
        store.insert_stake(&stake("0xaa", "0xs1", 10, 70)).await.unwrap();
        let before = store.refresh_pool_aggregate(1, at()).await.unwrap();
        assert!(before.params.is_none());

        let params = PoolParams {
            pool_id: 1,
            min_amount: TokenAmount::from_u128(1),
            max_amount: TokenAmount::from_u128(1_000),
            apy: 1200,
            lock_period: 86_400,
            created_block: 1,
        };
        assert!(store.ensure_pool(&params, at()).await.unwrap());
        assert!(!store.ensure_pool(&params, at()).await.unwrap());

        let pool = store.pool_aggregate(1).await.unwrap().unwrap();
        assert_eq!(pool.total_staked, TokenAmount::from_u128(70));
        assert_eq!(pool.params, Some(params));
    }

    #[tokio::test]
    async fn leaderboard_and_stats() {
        let store = InMemoryStorage::new();
        for (owner, tx, amount) in [("0xaa", "0x1", 5u128), ("0xbb", "0x2", 50), ("0xcc", "0x3", 0)] {
            store.ensure_user(owner, at()).await.unwrap();
            store.insert_stake(&stake(owner, tx, 1, amount)).await.unwrap();
            store.refresh_user_aggregate(owner, at()).await.unwrap();
        }
        store.refresh_pool_aggregate(1, at()).await.unwrap();

        let top = store.top_stakers(10).await.unwrap();
        let order: Vec<_> = top.iter().map(|u| u.address.as_str()).collect();
        assert_eq!(order, vec!["0xbb", "0xaa"]);

        let stats = store.platform_stats().await.unwrap();
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.total_pools, 1);
        assert_eq!(stats.total_stakers, 2);
        assert_eq!(stats.total_value_locked, TokenAmount::from_u128(55));
    }
}
