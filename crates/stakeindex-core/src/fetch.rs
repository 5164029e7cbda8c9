//! Fetch loop: stages new chain events into the event log.
//!
//! One tick:
//! 1. load the cursor and the chain head;
//! 2. pick the next chunk `[cursor + 1, min(cursor + chunk_size, head)]`;
//! 3. fetch every tracked event kind for that chunk, then upsert the merged
//!    events in chain order;
//! 4. only then advance the cursor to the end of the chunk.
//!
//! Any error aborts the tick before step 4, so the next tick re-fetches the
//! same range. Re-staging is an upsert, which makes that safe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainClient;
use crate::config::IndexerConfig;
use crate::cursor::{BlockRange, Cursor};
use crate::error::IndexerError;
use crate::store::{CursorStore, EventLogStore};
use crate::types::{AppendOutcome, EventKind, RawEvent};

/// Result of a single fetch tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cursor is already at the head.
    CaughtUp { head: u64 },
    /// A chunk was staged and the cursor advanced to `range.to`.
    Staged {
        range: BlockRange,
        head: u64,
        stats: StageStats,
    },
}

impl FetchOutcome {
    pub fn is_caught_up(&self) -> bool {
        matches!(self, Self::CaughtUp { .. })
    }
}

/// Per-chunk staging counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Events the client returned outside the requested range.
    pub out_of_range: u64,
}

impl StageStats {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }

    fn record(&mut self, outcome: AppendOutcome) {
        match outcome {
            AppendOutcome::Inserted => self.inserted += 1,
            AppendOutcome::Updated => self.updated += 1,
            AppendOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Stages chain events in bounded chunks.
pub struct FetchLoop<C, S: ?Sized> {
    client: Arc<C>,
    store: Arc<S>,
    indexer_id: String,
    deployment_block: u64,
    chunk_size: u64,
    rpc_timeout: Duration,
}

impl<C, S> FetchLoop<C, S>
where
    C: ChainClient,
    S: EventLogStore + CursorStore + ?Sized,
{
    pub fn new(config: &IndexerConfig, client: Arc<C>, store: Arc<S>) -> Self {
        Self {
            client,
            store,
            indexer_id: config.id.clone(),
            deployment_block: config.deployment_block,
            chunk_size: config.chunk_size.max(1),
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Load the persisted cursor.
    pub async fn cursor(&self) -> Result<Cursor, IndexerError> {
        let last = self.store.load(&self.indexer_id).await?;
        Ok(Cursor::new(last, self.deployment_block))
    }

    /// Chain head, bounded by the RPC timeout.
    pub async fn head(&self) -> Result<u64, IndexerError> {
        self.bounded(self.client.current_height()).await
    }

    /// Run one fetch tick.
    pub async fn tick(&self) -> Result<FetchOutcome, IndexerError> {
        let cursor = self.cursor().await?;
        let head = self.head().await?;

        let Some(range) = cursor.next_range(head, self.chunk_size) else {
            tracing::debug!(head, next = cursor.next_block(), "fetch: caught up");
            return Ok(FetchOutcome::CaughtUp { head });
        };

        let stats = self.stage_range(range).await?;

        // Last step: the chunk is durably staged.
        self.store.advance(&self.indexer_id, range.to).await?;

        tracing::info!(
            from = range.from,
            to = range.to,
            head,
            staged = stats.total(),
            inserted = stats.inserted,
            updated = stats.updated,
            "fetch: chunk staged"
        );
        Ok(FetchOutcome::Staged { range, head, stats })
    }

    /// Tick until the cursor reaches the head observed on the last tick.
    /// Returns the number of chunks staged.
    pub async fn catch_up(&self) -> Result<u64, IndexerError> {
        let mut chunks = 0;
        loop {
            match self.tick().await? {
                FetchOutcome::CaughtUp { .. } => return Ok(chunks),
                FetchOutcome::Staged { .. } => chunks += 1,
            }
        }
    }

    async fn stage_range(&self, range: BlockRange) -> Result<StageStats, IndexerError> {
        let mut stats = StageStats::default();
        let mut chunk: Vec<RawEvent> = Vec::new();
        for kind in EventKind::ALL {
            let events = self
                .bounded(self.client.fetch_events(kind, range.from, range.to))
                .await?;
            for event in events {
                if event.block_number < range.from || event.block_number > range.to {
                    tracing::warn!(
                        event = %event.kind,
                        block = event.block_number,
                        from = range.from,
                        to = range.to,
                        "fetch: client returned event outside requested range; ignoring"
                    );
                    stats.out_of_range += 1;
                    continue;
                }
                if event.kind != kind {
                    tracing::warn!(
                        expected = %kind,
                        got = %event.kind,
                        tx_hash = %event.tx_hash,
                        "fetch: client returned event of another kind"
                    );
                }
                chunk.push(event);
            }
        }

        // Nothing from this chunk is visible to apply until every kind is in
        // hand, and what becomes visible is always a chain-order prefix.
        chunk.sort_by_key(RawEvent::position);
        for event in chunk {
            let outcome = self.store.append(event).await?;
            stats.record(outcome);
        }
        Ok(stats)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, IndexerError>>,
    ) -> Result<T, IndexerError> {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(IndexerError::Timeout {
                ms: self.rpc_timeout.as_millis() as u64,
            }),
        }
    }
}
