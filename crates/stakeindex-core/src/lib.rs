//! stakeindex-core: staged event log and apply pipeline for a staking contract.
//!
//! # Architecture
//!
//! ```text
//! ChainClient ──► FetchLoop ──► EventLogStore ──► ApplyLoop ──► StakingStore
//!                    │         (upsert by          │            (stakes, ledger,
//!                    ▼          tx_hash+log_index)  │             aggregates)
//!               CursorStore                         └──► Notifier (live only)
//!
//! Indexer = bootstrap catch-up + fetch timer + apply timer + sync_now
//! ```

pub mod aggregate;
pub mod amount;
pub mod apply;
pub mod backfill;
pub mod chain;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod fetch;
pub mod model;
pub mod notifier;
pub mod scheduler;
pub mod store;
pub mod types;

pub use amount::TokenAmount;
pub use apply::{ApplyLoop, ApplyOutcome, ApplyReport};
pub use backfill::BackfillReport;
pub use chain::ChainClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IndexerBuilder, IndexerConfig, IndexerState};
pub use cursor::{BlockRange, Cursor};
pub use error::IndexerError;
pub use event::StakingEvent;
pub use fetch::{FetchLoop, FetchOutcome, StageStats};
pub use model::{
    EventId, PlatformStats, PoolAggregate, PoolParams, Stake, Transaction, TransactionKind,
    UserAggregate,
};
pub use notifier::{BroadcastNotifier, NoopNotifier, Notifier, StakeNotification};
pub use scheduler::{Indexer, IndexerStatus, SyncReport};
pub use store::{CursorStore, EventLogStore, IndexerStore, StakingReader, StakingStore};
pub use types::{AppendOutcome, EventKind, IndexPhase, RawEvent, StagedEvent};
