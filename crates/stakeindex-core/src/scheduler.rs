//! The indexer handle: owns the two periodic loops.
//!
//! ```text
//!            start()
//!               │
//!      bootstrap? ──yes──► catch_up (fetch to head, drain apply)
//!               │
//!      ┌────────┴─────────┐
//!      ▼                  ▼
//!  fetch timer        apply timer        sync_now(): one fetch tick then one
//!  (30s default)      (60s default)      apply tick, queued behind any
//!      │                  │              in-flight tick
//!      └──── stop() ──────┘
//! ```
//!
//! Each loop has its own guard. A timer tick that fires while the previous
//! tick of the same loop is still running is skipped, so ticks of one loop
//! never overlap. `stop()` lets an in-flight tick finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::apply::{ApplyLoop, ApplyReport};
use crate::backfill::{catch_up, BackfillReport};
use crate::chain::ChainClient;
use crate::clock::{Clock, SystemClock};
use crate::config::{IndexerConfig, IndexerState};
use crate::error::IndexerError;
use crate::fetch::{FetchLoop, FetchOutcome};
use crate::notifier::{NoopNotifier, Notifier};
use crate::store::{CursorStore, EventLogStore, IndexerStore};
use crate::types::IndexPhase;

/// Point-in-time view of indexing progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStatus {
    pub is_running: bool,
    pub state: IndexerState,
    /// Highest block among processed events.
    pub last_processed_block: u64,
    /// Highest block whose events are fully staged.
    pub last_fetched_block: Option<u64>,
    pub unprocessed_events: u64,
    pub total_events: u64,
    pub checked_at: DateTime<Utc>,
}

impl IndexerStatus {
    /// Read the persisted progress counters for `indexer_id`.
    pub async fn read<S>(
        store: &S,
        indexer_id: &str,
        is_running: bool,
        state: IndexerState,
        checked_at: DateTime<Utc>,
    ) -> Result<Self, IndexerError>
    where
        S: EventLogStore + CursorStore + ?Sized,
    {
        Ok(Self {
            is_running,
            state,
            last_processed_block: store.last_processed_block().await?,
            last_fetched_block: store.load(indexer_id).await?,
            unprocessed_events: store.unprocessed_count().await?,
            total_events: store.total_count().await?,
            checked_at,
        })
    }
}

/// Result of one manual fetch + apply cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub fetch: FetchOutcome,
    pub apply: ApplyReport,
}

struct Shared<C, S: ?Sized> {
    config: IndexerConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    fetch: FetchLoop<C, S>,
    apply: ApplyLoop<S>,
    fetch_guard: Mutex<()>,
    apply_guard: Mutex<()>,
    running: AtomicBool,
    state: StdMutex<IndexerState>,
}

impl<C, S> Shared<C, S>
where
    C: ChainClient,
    S: IndexerStore + ?Sized,
{
    fn state(&self) -> IndexerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: IndexerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        tracing::debug!(%state, indexer = %self.config.id, "indexer state changed");
    }

    /// One fetch tick. With `wait == false` the tick is skipped if another
    /// fetch tick holds the guard.
    async fn fetch_tick(&self, wait: bool) -> Option<Result<FetchOutcome, IndexerError>> {
        let _guard = if wait {
            self.fetch_guard.lock().await
        } else {
            match self.fetch_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!("fetch tick skipped: previous tick still running");
                    return None;
                }
            }
        };
        let result = self.fetch.tick().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "fetch tick failed; retrying on next tick");
        }
        Some(result)
    }

    async fn apply_tick(&self, wait: bool) -> Option<Result<ApplyReport, IndexerError>> {
        let _guard = if wait {
            self.apply_guard.lock().await
        } else {
            match self.apply_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!("apply tick skipped: previous tick still running");
                    return None;
                }
            }
        };
        let result = self.apply.tick(IndexPhase::Live).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "apply tick failed; retrying on next tick");
        }
        Some(result)
    }

    async fn bootstrap(&self) -> Result<BackfillReport, IndexerError> {
        let _fetch = self.fetch_guard.lock().await;
        let _apply = self.apply_guard.lock().await;
        catch_up(&self.fetch, &self.apply).await
    }
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Fetch,
    Apply,
}

/// A running (or runnable) staking indexer.
pub struct Indexer<C, S: ?Sized> {
    shared: Arc<Shared<C, S>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C, S> Indexer<C, S>
where
    C: ChainClient + 'static,
    S: IndexerStore + ?Sized + 'static,
{
    /// Build an indexer with the system clock and no notifications.
    pub fn new(config: IndexerConfig, client: Arc<C>, store: Arc<S>) -> Result<Self, IndexerError> {
        Self::with_parts(
            config,
            client,
            store,
            Arc::new(NoopNotifier),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: IndexerConfig,
        client: Arc<C>,
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let fetch = FetchLoop::new(&config, client, Arc::clone(&store));
        let apply = ApplyLoop::new(
            Arc::clone(&store),
            notifier,
            Arc::clone(&clock),
            config.apply_batch_size,
        );
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                clock,
                fetch,
                apply,
                fetch_guard: Mutex::new(()),
                apply_guard: Mutex::new(()),
                running: AtomicBool::new(false),
                state: StdMutex::new(IndexerState::Idle),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> IndexerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the indexer.
    ///
    /// Fails if the chain head or the cursor cannot be read. When bootstrap is
    /// enabled, runs the catch-up before the timers start; a catch-up error is
    /// logged and the timers resume from wherever it stopped. A `stop()`
    /// during the catch-up cancels it and `start` returns
    /// [`IndexerError::Aborted`].
    pub async fn start(&self) -> Result<(), IndexerError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(indexer = %self.shared.config.id, "indexer already running");
            return Ok(());
        }

        if let Err(e) = self.preflight().await {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.shutdown.send_replace(false);
        let mut stop_rx = self.shutdown.subscribe();

        if self.shared.config.bootstrap {
            self.shared.set_state(IndexerState::Backfilling);
            tokio::select! {
                result = self.shared.bootstrap() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "bootstrap failed; continuing on timers");
                    }
                }
                _ = async { stop_rx.wait_for(|stop| *stop).await.is_ok() } => {
                    return Err(self.aborted("stopped during bootstrap"));
                }
            }
        }

        let mut tasks = self.tasks.lock().await;
        if *self.shutdown.borrow() {
            return Err(self.aborted("stopped before timers started"));
        }
        tasks.push(self.spawn_loop(LoopKind::Fetch, self.shared.config.fetch_interval()));
        tasks.push(self.spawn_loop(LoopKind::Apply, self.shared.config.apply_interval()));
        self.shared.set_state(IndexerState::Live);

        tracing::info!(
            indexer = %self.shared.config.id,
            contract = %self.shared.config.contract_address,
            fetch_interval_ms = self.shared.config.fetch_interval_ms,
            apply_interval_ms = self.shared.config.apply_interval_ms,
            "indexer started"
        );
        Ok(())
    }

    fn aborted(&self, reason: &str) -> IndexerError {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_state(IndexerState::Stopped);
        tracing::warn!(indexer = %self.shared.config.id, reason, "indexer start aborted");
        IndexerError::Aborted {
            reason: reason.to_string(),
        }
    }

    async fn preflight(&self) -> Result<(), IndexerError> {
        let cursor = self.shared.fetch.cursor().await?;
        let head = self.shared.fetch.head().await?;
        tracing::info!(
            head,
            next_block = cursor.next_block(),
            lag = cursor.lag(head),
            "indexer preflight ok"
        );
        Ok(())
    }

    /// Stop both timers and wait for in-flight ticks to finish.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.shared.set_state(IndexerState::Stopping);
        self.shutdown.send_replace(true);

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "indexer task ended abnormally");
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_state(IndexerState::Stopped);
        tracing::info!(indexer = %self.shared.config.id, "indexer stopped");
    }

    /// Current progress counters.
    pub async fn status(&self) -> Result<IndexerStatus, IndexerError> {
        IndexerStatus::read(
            self.shared.store.as_ref(),
            &self.shared.config.id,
            self.is_running(),
            self.state(),
            self.shared.clock.now(),
        )
        .await
    }

    /// Trigger one fetch tick followed by one apply tick in the background.
    ///
    /// Returns immediately. If a tick of either loop is in flight, the
    /// triggered tick waits for it rather than running alongside it.
    pub fn sync_now(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tracing::info!("manual sync triggered");
            shared.fetch_tick(true).await;
            shared.apply_tick(true).await;
        })
    }

    /// Run one fetch tick then one apply tick and wait for both.
    ///
    /// Unlike [`sync_now`](Self::sync_now), the first error is returned to
    /// the caller. The apply tick still runs when the fetch tick fails, so
    /// an already staged backlog is not held up by an unreachable node.
    pub async fn sync_once(&self) -> Result<SyncReport, IndexerError> {
        let fetch = {
            let _guard = self.shared.fetch_guard.lock().await;
            self.shared.fetch.tick().await
        };
        let apply = {
            let _guard = self.shared.apply_guard.lock().await;
            self.shared.apply.tick(IndexPhase::Live).await
        };
        Ok(SyncReport {
            fetch: fetch?,
            apply: apply?,
        })
    }

    fn spawn_loop(&self, kind: LoopKind, period: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match kind {
                    LoopKind::Fetch => {
                        shared.fetch_tick(false).await;
                    }
                    LoopKind::Apply => {
                        shared.apply_tick(false).await;
                    }
                }
            }
            tracing::debug!(loop_kind = ?kind, "indexer loop exited");
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case_fields() {
        let status = IndexerStatus {
            is_running: true,
            state: IndexerState::Live,
            last_processed_block: 200,
            last_fetched_block: Some(250),
            unprocessed_events: 3,
            total_events: 10,
            checked_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["is_running"], true);
        assert_eq!(json["state"], "live");
        assert_eq!(json["last_processed_block"], 200);
        assert_eq!(json["last_fetched_block"], 250);
        assert_eq!(json["unprocessed_events"], 3);
    }

    #[test]
    fn status_without_cursor_serializes_null() {
        let status = IndexerStatus {
            is_running: false,
            state: IndexerState::Idle,
            last_processed_block: 0,
            last_fetched_block: None,
            unprocessed_events: 0,
            total_events: 0,
            checked_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["last_fetched_block"].is_null());
        assert_eq!(json["state"], "idle");
    }
}
