//! Shared types for the staging pipeline.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{hex, keccak256};
use serde::{Deserialize, Serialize};

// ─── EventKind ───────────────────────────────────────────────────────────────

/// The staking contract events the indexer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Staked,
    Unstaked,
    RewardClaimed,
    PoolCreated,
}

impl EventKind {
    /// Every tracked kind, in the order the fetch loop queries them.
    pub const ALL: [EventKind; 4] = [
        EventKind::PoolCreated,
        EventKind::Staked,
        EventKind::Unstaked,
        EventKind::RewardClaimed,
    ];

    /// Event name as emitted by the contract.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Staked => "Staked",
            Self::Unstaked => "Unstaked",
            Self::RewardClaimed => "RewardClaimed",
            Self::PoolCreated => "PoolCreated",
        }
    }

    /// Canonical ABI signature used for the topic0 hash.
    pub fn signature(&self) -> &'static str {
        match self {
            Self::Staked => "Staked(address,uint256,uint256)",
            Self::Unstaked => "Unstaked(address,uint256,uint256,uint256)",
            Self::RewardClaimed => "RewardClaimed(address,uint256,uint256)",
            Self::PoolCreated => "PoolCreated(uint256,uint256,uint256,uint256,uint256)",
        }
    }

    /// `keccak256(signature)` as `0x`-prefixed lowercase hex.
    pub fn topic0(&self) -> String {
        hex::encode_prefixed(keccak256(self.signature().as_bytes()))
    }

    /// Reverse lookup from a log's topic0.
    pub fn from_topic0(topic0: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.topic0().eq_ignore_ascii_case(topic0))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

// ─── RawEvent ────────────────────────────────────────────────────────────────

/// An event as observed on chain, before staging.
///
/// Identity is `(tx_hash, log_index)`; re-observing the same pair is an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    /// Emitting contract (`0x…`, lowercase).
    pub contract_address: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u32,
    /// Unix timestamp (seconds) of the containing block.
    pub block_timestamp: i64,
    /// Decoded event arguments; amounts are base-10 strings.
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Chain ordering key.
    pub fn position(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }
}

// ─── StagedEvent ─────────────────────────────────────────────────────────────

/// A row of the event log: a raw event plus its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEvent {
    /// Store-assigned row id.
    pub id: i64,
    pub event: RawEvent,
    pub processed: bool,
    /// Warning recorded when the event was skipped as an anomaly.
    pub note: Option<String>,
}

/// Result of [`EventLogStore::append`](crate::store::EventLogStore::append).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// First observation of this `(tx_hash, log_index)`.
    Inserted,
    /// Content changed; the row was rewritten and reset to unprocessed.
    Updated,
    /// Identical re-observation; nothing changed.
    Unchanged,
}

// ─── IndexPhase ──────────────────────────────────────────────────────────────

/// The phase the indexer is in when an event is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPhase {
    /// Catching up from the deployment block (startup bootstrap).
    Backfill,
    /// Following the chain on the periodic timers.
    Live,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
