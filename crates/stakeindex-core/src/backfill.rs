//! Startup catch-up.
//!
//! Stages every chunk between the cursor and the current head, then applies
//! the staged backlog. Events applied here run in [`IndexPhase::Backfill`],
//! so no notifications are sent for historical activity.

use std::time::Instant;

use crate::apply::{ApplyLoop, ApplyReport};
use crate::chain::ChainClient;
use crate::error::IndexerError;
use crate::fetch::FetchLoop;
use crate::store::{CursorStore, EventLogStore, StakingStore};
use crate::types::IndexPhase;

/// Summary of a completed catch-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Chunks staged by the fetch phase.
    pub chunks: u64,
    /// Cursor position when the fetch phase finished.
    pub cursor: Option<u64>,
    pub apply: ApplyReport,
}

/// Catch up from the persisted cursor (or the deployment block on a first
/// run) to the chain head, then drain the apply queue.
pub async fn catch_up<C, S>(
    fetch: &FetchLoop<C, S>,
    apply: &ApplyLoop<S>,
) -> Result<BackfillReport, IndexerError>
where
    C: ChainClient,
    S: EventLogStore + CursorStore + StakingStore + ?Sized,
{
    let started = Instant::now();
    let start = fetch.cursor().await?;
    tracing::info!(
        from = start.next_block(),
        "backfill: catching up to chain head"
    );

    let chunks = fetch.catch_up().await?;
    let cursor = fetch.cursor().await?.last_staged;
    let apply = apply.drain(IndexPhase::Backfill).await?;

    tracing::info!(
        chunks,
        cursor,
        applied = apply.applied,
        skipped = apply.skipped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backfill: complete"
    );
    Ok(BackfillReport {
        chunks,
        cursor,
        apply,
    })
}
