//! Fetch cursor: the staging watermark.

use serde::{Deserialize, Serialize};

/// The fetch loop's position in the chain.
///
/// `last_staged` is the highest block whose events are durably in the event
/// log (`None` before the first chunk). Blocks before `start_block` (the
/// contract's deployment block) are never fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_staged: Option<u64>,
    pub start_block: u64,
}

/// An inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl Cursor {
    pub fn new(last_staged: Option<u64>, start_block: u64) -> Self {
        Self {
            last_staged,
            start_block,
        }
    }

    /// The next block to fetch.
    pub fn next_block(&self) -> u64 {
        match self.last_staged {
            Some(b) => b.saturating_add(1).max(self.start_block),
            None => self.start_block,
        }
    }

    /// The next chunk to fetch given the chain head, or `None` if caught up.
    ///
    /// `to = min(next + chunk_size - 1, head)`.
    pub fn next_range(&self, head: u64, chunk_size: u64) -> Option<BlockRange> {
        let from = self.next_block();
        if from > head {
            return None;
        }
        let span = chunk_size.max(1) - 1;
        Some(BlockRange {
            from,
            to: from.saturating_add(span).min(head),
        })
    }

    /// Move the watermark forward. Lower values are ignored.
    pub fn advance(&mut self, block: u64) {
        self.last_staged = Some(self.last_staged.map_or(block, |b| b.max(block)));
    }

    /// Blocks between the watermark and `head` still to be staged.
    pub fn lag(&self, head: u64) -> u64 {
        head.saturating_add(1).saturating_sub(self.next_block())
    }
}
