//! Apply loop: folds staged events into the staking tables.
//!
//! Each tick reads up to `apply_batch_size` unprocessed events in
//! `(block_number, log_index)` order and applies them one at a time:
//!
//! ```text
//! decode ──► handler (idempotent writes) ──► mark processed ──► notify (live only)
//!   │                │
//!   │ malformed      │ no matching stake
//!   ▼                ▼
//! mark skipped with a note, aggregates unchanged
//! ```
//!
//! A transient error (RPC, storage, timeout) stops the batch at that event
//! without marking it, so later events are never applied ahead of it.

use std::sync::Arc;

use crate::amount::TokenAmount;
use crate::clock::Clock;
use crate::error::IndexerError;
use crate::event::{PoolCreatedArgs, RewardClaimedArgs, StakedArgs, StakingEvent, UnstakedArgs};
use crate::model::{
    block_time, EventId, PoolParams, Stake, StakeClosure, Transaction, TransactionKind,
    TransactionStatus,
};
use crate::notifier::{NotificationKind, Notifier, StakeNotification};
use crate::store::{EventLogStore, StakingStore};
use crate::types::{IndexPhase, RawEvent, StagedEvent};

/// What applying a single event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New rows were written. Carries the notification to send, if any.
    Applied(Option<StakeNotification>),
    /// Every write was already present; the event had been applied before.
    AlreadyApplied,
    /// The event cannot be applied; it is marked processed with this note.
    Skipped(String),
}

/// Counters for one or more apply batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: u64,
    pub already_applied: u64,
    pub skipped: u64,
    pub notified: u64,
}

impl ApplyReport {
    /// Events marked processed (applied, replayed or skipped).
    pub fn processed(&self) -> u64 {
        self.applied + self.already_applied + self.skipped
    }

    fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.already_applied += other.already_applied;
        self.skipped += other.skipped;
        self.notified += other.notified;
    }
}

/// Applies staged events to the derived tables.
pub struct ApplyLoop<S: ?Sized> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl<S> ApplyLoop<S>
where
    S: EventLogStore + StakingStore + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Apply one batch of unprocessed events.
    pub async fn tick(&self, phase: IndexPhase) -> Result<ApplyReport, IndexerError> {
        let batch = self.store.list_unprocessed(self.batch_size).await?;
        let mut report = ApplyReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        for staged in &batch {
            self.process(staged, phase, &mut report).await?;
        }

        tracing::info!(
            phase = ?phase,
            batch = batch.len(),
            applied = report.applied,
            replayed = report.already_applied,
            skipped = report.skipped,
            "apply: batch complete"
        );
        Ok(report)
    }

    /// Apply batches until no unprocessed events remain.
    pub async fn drain(&self, phase: IndexPhase) -> Result<ApplyReport, IndexerError> {
        let mut total = ApplyReport::default();
        loop {
            let report = self.tick(phase).await?;
            if report.processed() == 0 {
                return Ok(total);
            }
            total.merge(report);
        }
    }

    async fn process(
        &self,
        staged: &StagedEvent,
        phase: IndexPhase,
        report: &mut ApplyReport,
    ) -> Result<(), IndexerError> {
        let raw = &staged.event;
        let outcome = match self.apply_event(raw).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_data_anomaly() => ApplyOutcome::Skipped(e.to_string()),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    event = %raw.kind,
                    tx_hash = %raw.tx_hash,
                    log_index = raw.log_index,
                    "apply: stopping batch; event will be retried"
                );
                return Err(e);
            }
        };

        match outcome {
            ApplyOutcome::Applied(notification) => {
                self.store.mark_processed(staged.id).await?;
                report.applied += 1;
                if let (IndexPhase::Live, Some(n)) = (phase, notification) {
                    if self.send(n).await {
                        report.notified += 1;
                    }
                }
            }
            ApplyOutcome::AlreadyApplied => {
                self.store.mark_processed(staged.id).await?;
                report.already_applied += 1;
            }
            ApplyOutcome::Skipped(reason) => {
                tracing::warn!(
                    event = %raw.kind,
                    tx_hash = %raw.tx_hash,
                    log_index = raw.log_index,
                    block = raw.block_number,
                    %reason,
                    "apply: skipping event"
                );
                self.store.mark_skipped(staged.id, &reason).await?;
                report.skipped += 1;
            }
        }
        Ok(())
    }

    async fn send(&self, notification: StakeNotification) -> bool {
        match self.notifier.notify(notification).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "apply: notification failed");
                false
            }
        }
    }

    /// Decode and apply a single event. Safe to call repeatedly for the same
    /// event: the second call writes nothing and returns
    /// [`ApplyOutcome::AlreadyApplied`].
    pub async fn apply_event(&self, raw: &RawEvent) -> Result<ApplyOutcome, IndexerError> {
        match StakingEvent::decode(raw)? {
            StakingEvent::Staked(args) => self.on_staked(raw, args).await,
            StakingEvent::Unstaked(args) => self.on_unstaked(raw, args).await,
            StakingEvent::RewardClaimed(args) => self.on_reward_claimed(raw, args).await,
            StakingEvent::PoolCreated(args) => self.on_pool_created(raw, args).await,
        }
    }

    async fn on_staked(
        &self,
        raw: &RawEvent,
        args: StakedArgs,
    ) -> Result<ApplyOutcome, IndexerError> {
        let at = block_time(raw.block_timestamp);
        let id = EventId::new(&raw.tx_hash, raw.log_index);

        self.store.ensure_user(&args.user, at).await?;

        let stake = Stake {
            owner: args.user.clone(),
            pool_id: args.pool_id,
            amount: args.amount,
            opened_by: id.clone(),
            block_number: raw.block_number,
            staked_at: at,
            active: true,
            unstaked_at: None,
            closed_by: None,
            reward: TokenAmount::ZERO,
            early_unstake: false,
        };
        let created = self.store.insert_stake(&stake).await?;

        let tx = Transaction {
            owner: args.user.clone(),
            event: id,
            kind: TransactionKind::Stake,
            amount: args.amount,
            pool_id: Some(args.pool_id),
            block_number: raw.block_number,
            status: TransactionStatus::Confirmed,
            timestamp: at,
        };
        let recorded = self.store.insert_transaction(&tx).await?;

        // Always recompute: a crash between the inserts and here heals on replay.
        let now = self.clock.now();
        self.store.refresh_user_aggregate(&args.user, now).await?;
        self.store.refresh_pool_aggregate(args.pool_id, now).await?;

        if !(created || recorded) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        tracing::debug!(
            user = %args.user,
            pool = args.pool_id,
            amount = %args.amount,
            block = raw.block_number,
            "apply: stake opened"
        );
        Ok(ApplyOutcome::Applied(created.then(|| StakeNotification {
            kind: NotificationKind::StakeCreated,
            user_address: args.user,
            pool_id: args.pool_id,
            amount: args.amount,
            reward: None,
            tx_hash: raw.tx_hash.clone(),
            block_number: raw.block_number,
        })))
    }

    async fn on_unstaked(
        &self,
        raw: &RawEvent,
        args: UnstakedArgs,
    ) -> Result<ApplyOutcome, IndexerError> {
        let at = block_time(raw.block_timestamp);
        let id = EventId::new(&raw.tx_hash, raw.log_index);

        let (stake, closed_now) = match self.store.stake_closed_by(&id).await? {
            Some(stake) => (stake, false),
            None => {
                let candidates = self
                    .store
                    .active_stakes_in_pool(&args.user, args.pool_id)
                    .await?;
                let Some(stake) = match_stake(candidates, &args) else {
                    return Ok(ApplyOutcome::Skipped(format!(
                        "no active stake for {} in pool {}",
                        args.user, args.pool_id
                    )));
                };
                let closure = StakeClosure {
                    closed_by: id.clone(),
                    unstaked_at: at,
                    reward: args.reward,
                };
                let changed = self.store.close_stake(&stake.opened_by, &closure).await?;
                (stake, changed)
            }
        };

        if stake.amount != args.amount {
            tracing::warn!(
                user = %args.user,
                pool = args.pool_id,
                staked = %stake.amount,
                unstaked = %args.amount,
                "apply: unstake amount differs from matched stake"
            );
        }

        let unstake_tx = Transaction {
            owner: args.user.clone(),
            event: id.clone(),
            kind: TransactionKind::Unstake,
            amount: args.amount,
            pool_id: Some(args.pool_id),
            block_number: raw.block_number,
            status: TransactionStatus::Confirmed,
            timestamp: at,
        };
        let mut recorded = self.store.insert_transaction(&unstake_tx).await?;

        if !args.reward.is_zero() {
            let reward_tx = Transaction {
                kind: TransactionKind::Reward,
                amount: args.reward,
                ..unstake_tx
            };
            recorded |= self.store.insert_transaction(&reward_tx).await?;
        }

        let now = self.clock.now();
        self.store.refresh_user_aggregate(&args.user, now).await?;
        self.store.refresh_pool_aggregate(args.pool_id, now).await?;

        if !(closed_now || recorded) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        tracing::debug!(
            user = %args.user,
            pool = args.pool_id,
            amount = %args.amount,
            reward = %args.reward,
            opened_by = %stake.opened_by,
            "apply: stake closed"
        );
        Ok(ApplyOutcome::Applied(closed_now.then(|| StakeNotification {
            kind: NotificationKind::StakeUnstaked,
            user_address: args.user,
            pool_id: args.pool_id,
            amount: args.amount,
            reward: Some(args.reward),
            tx_hash: raw.tx_hash.clone(),
            block_number: raw.block_number,
        })))
    }

    async fn on_reward_claimed(
        &self,
        raw: &RawEvent,
        args: RewardClaimedArgs,
    ) -> Result<ApplyOutcome, IndexerError> {
        let at = block_time(raw.block_timestamp);
        self.store.ensure_user(&args.user, at).await?;

        let tx = Transaction {
            owner: args.user.clone(),
            event: EventId::new(&raw.tx_hash, raw.log_index),
            kind: TransactionKind::Reward,
            amount: args.amount,
            pool_id: None,
            block_number: raw.block_number,
            status: TransactionStatus::Confirmed,
            timestamp: at,
        };
        let recorded = self.store.insert_transaction(&tx).await?;
        self.store
            .refresh_user_aggregate(&args.user, self.clock.now())
            .await?;

        Ok(if recorded {
            ApplyOutcome::Applied(None)
        } else {
            ApplyOutcome::AlreadyApplied
        })
    }

    async fn on_pool_created(
        &self,
        raw: &RawEvent,
        args: PoolCreatedArgs,
    ) -> Result<ApplyOutcome, IndexerError> {
        let params = PoolParams {
            pool_id: args.pool_id,
            min_amount: args.min_amount,
            max_amount: args.max_amount,
            apy: args.apy,
            lock_period: args.lock_period,
            created_block: raw.block_number,
        };
        let created = self.store.ensure_pool(&params, self.clock.now()).await?;
        Ok(if created {
            ApplyOutcome::Applied(None)
        } else {
            ApplyOutcome::AlreadyApplied
        })
    }
}

/// Pick the stake an `Unstaked` event closes: the oldest active stake with
/// the same amount, else the oldest active stake in the pool.
fn match_stake(candidates: Vec<Stake>, args: &UnstakedArgs) -> Option<Stake> {
    let exact = candidates.iter().position(|s| s.amount == args.amount);
    let idx = match exact {
        Some(i) => i,
        None if candidates.is_empty() => return None,
        None => 0,
    };
    candidates.into_iter().nth(idx)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
