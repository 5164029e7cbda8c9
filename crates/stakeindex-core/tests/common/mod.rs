//! Shared fixtures: a scripted chain, a recording notifier and event builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use stakeindex_core::event::{
    PoolCreatedArgs, RewardClaimedArgs, StakedArgs, StakingEvent, UnstakedArgs,
};
use stakeindex_core::{
    ApplyLoop, ApplyReport, ChainClient, EventKind, FetchLoop, IndexPhase, IndexerBuilder,
    IndexerConfig, IndexerError, ManualClock, Notifier, RawEvent, StakeNotification, TokenAmount,
};
use stakeindex_storage::InMemoryStorage;

pub const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";

// ─── Scripted chain ──────────────────────────────────────────────────────────

/// A chain whose head and logs are set by the test.
pub struct ScriptedChain {
    head: AtomicU64,
    events: Mutex<Vec<RawEvent>>,
    failing: Mutex<Option<EventKind>>,
    head_down: AtomicBool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetch_calls: AtomicUsize,
    gate: Mutex<Option<(EventKind, Arc<Gate>)>>,
}

impl ScriptedChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            events: Mutex::new(Vec::new()),
            failing: Mutex::new(None),
            head_down: AtomicBool::new(false),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Every `fetch_events` call sleeps this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_events(self, events: impl IntoIterator<Item = RawEvent>) -> Self {
        self.events.lock().unwrap().extend(events);
        self
    }

    pub fn push(&self, event: RawEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Make `fetch_events` fail for `kind` (or stop failing with `None`).
    pub fn fail_on(&self, kind: Option<EventKind>) {
        *self.failing.lock().unwrap() = kind;
    }

    /// Hold every `fetch_events` call for `kind` until the returned gate
    /// is opened.
    pub fn pause_on(&self, kind: EventKind) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some((kind, Arc::clone(&gate)));
        gate
    }

    pub fn set_head_down(&self, down: bool) {
        self.head_down.store(down, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        if self.head_down.load(Ordering::SeqCst) {
            return Err(IndexerError::Rpc("connection refused".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, IndexerError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let gate = self
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(k, _)| *k == kind)
            .map(|(_, g)| Arc::clone(g));
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.open.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.failing.lock().unwrap() == Some(kind) {
            return Err(IndexerError::Rpc(format!("eth_getLogs failed for {kind}")));
        }
        let mut events: Vec<RawEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind && e.block_number >= from && e.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(RawEvent::position);
        Ok(events)
    }
}

/// A pause point inside `fetch_events`.
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    open: Notify,
}

impl Gate {
    /// Wait until a fetch call is parked at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn open(&self) {
        self.open.notify_one();
    }
}

// ─── Notifiers ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<StakeNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<StakeNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: StakeNotification) -> Result<(), IndexerError> {
        if self.fail {
            return Err(IndexerError::Other("subscriber went away".into()));
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

// ─── Event builders ──────────────────────────────────────────────────────────

pub fn tx_hash(block: u64, log_index: u32) -> String {
    format!("0x{block:060x}{log_index:04x}")
}

pub fn block_timestamp(block: u64) -> i64 {
    1_700_000_000 + block as i64 * 12
}

pub fn raw(kind: EventKind, block: u64, log_index: u32, payload: serde_json::Value) -> RawEvent {
    RawEvent {
        kind,
        contract_address: CONTRACT.into(),
        tx_hash: tx_hash(block, log_index),
        block_number: block,
        block_hash: format!("0x{block:064x}"),
        log_index,
        block_timestamp: block_timestamp(block),
        payload,
    }
}

pub fn pool_created(block: u64, log_index: u32, pool_id: u64) -> RawEvent {
    let event = StakingEvent::PoolCreated(PoolCreatedArgs {
        pool_id,
        min_amount: TokenAmount::from_u128(10),
        max_amount: TokenAmount::from_u128(1_000_000),
        apy: 1_200,
        lock_period: 2_592_000,
    });
    raw(EventKind::PoolCreated, block, log_index, event.to_payload())
}

pub fn staked(block: u64, log_index: u32, user: &str, pool_id: u64, amount: u128) -> RawEvent {
    let event = StakingEvent::Staked(StakedArgs {
        user: user.into(),
        pool_id,
        amount: TokenAmount::from_u128(amount),
    });
    raw(EventKind::Staked, block, log_index, event.to_payload())
}

pub fn unstaked(
    block: u64,
    log_index: u32,
    user: &str,
    pool_id: u64,
    amount: u128,
    reward: u128,
) -> RawEvent {
    let event = StakingEvent::Unstaked(UnstakedArgs {
        user: user.into(),
        pool_id,
        amount: TokenAmount::from_u128(amount),
        reward: TokenAmount::from_u128(reward),
    });
    raw(EventKind::Unstaked, block, log_index, event.to_payload())
}

pub fn reward_claimed(block: u64, log_index: u32, user: &str, amount: u128) -> RawEvent {
    let event = StakingEvent::RewardClaimed(RewardClaimedArgs {
        user: user.into(),
        amount: TokenAmount::from_u128(amount),
        timestamp: Some(block_timestamp(block) as u64),
    });
    raw(EventKind::RewardClaimed, block, log_index, event.to_payload())
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub fn test_config(chunk_size: u64) -> IndexerConfig {
    IndexerBuilder::new()
        .contract_address(CONTRACT)
        .deployment_block(0)
        .chunk_size(chunk_size)
        .build()
        .expect("valid config")
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_800_000_000, 0).unwrap()
}

/// Fetch and apply loops over one in-memory store.
pub struct Pipeline {
    pub chain: Arc<ScriptedChain>,
    pub store: Arc<InMemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub fetch: FetchLoop<ScriptedChain, InMemoryStorage>,
    pub apply: ApplyLoop<InMemoryStorage>,
}

impl Pipeline {
    pub fn new(chain: ScriptedChain, chunk_size: u64, batch_size: usize) -> Self {
        Self::with_notifier(chain, chunk_size, batch_size, RecordingNotifier::default())
    }

    pub fn with_notifier(
        chain: ScriptedChain,
        chunk_size: u64,
        batch_size: usize,
        notifier: RecordingNotifier,
    ) -> Self {
        let chain = Arc::new(chain);
        let store = Arc::new(InMemoryStorage::new());
        let notifier = Arc::new(notifier);
        let fetch = FetchLoop::new(&test_config(chunk_size), Arc::clone(&chain), Arc::clone(&store));
        let apply = ApplyLoop::new(
            Arc::clone(&store),
            notifier.clone(),
            Arc::new(ManualClock::new(epoch())),
            batch_size,
        );
        Self {
            chain,
            store,
            notifier,
            fetch,
            apply,
        }
    }

    /// Stage everything up to the head, then drain the apply queue.
    pub async fn sync(&self, phase: IndexPhase) -> ApplyReport {
        self.fetch.catch_up().await.expect("fetch catch-up");
        self.apply.drain(phase).await.expect("apply drain")
    }
}
