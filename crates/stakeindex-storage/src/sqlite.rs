//! SQLite storage backend for the staking indexer.
//!
//! Persists the staged event log, fetch cursors and the derived staking
//! tables to a single SQLite file via `sqlx`. Token amounts are stored as
//! base-10 TEXT and summed in Rust, so 256-bit values never pass through
//! SQLite's floating point.
//!
//! # Usage
//! ```rust,no_run
//! use stakeindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./stakeindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use stakeindex_core::aggregate;
use stakeindex_core::amount::TokenAmount;
use stakeindex_core::error::IndexerError;
use stakeindex_core::model::{
    EventId, PlatformStats, PoolAggregate, PoolParams, Stake, StakeClosure, Transaction,
    TransactionKind, TransactionStatus, UserAggregate,
};
use stakeindex_core::store::{CursorStore, EventLogStore, StakingReader, StakingStore};
use stakeindex_core::types::{AppendOutcome, EventKind, RawEvent, StagedEvent};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        kind            TEXT    NOT NULL,
        contract        TEXT    NOT NULL,
        tx_hash         TEXT    NOT NULL,
        log_index       INTEGER NOT NULL,
        block_number    INTEGER NOT NULL,
        block_hash      TEXT    NOT NULL,
        block_timestamp INTEGER NOT NULL,
        payload         TEXT    NOT NULL,
        processed       INTEGER NOT NULL DEFAULT 0,
        note            TEXT,
        UNIQUE (tx_hash, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_pending
        ON events (processed, block_number, log_index);",
    "CREATE TABLE IF NOT EXISTS cursors (
        indexer_id   TEXT    PRIMARY KEY,
        block_number INTEGER NOT NULL,
        updated_at   TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS users (
        address       TEXT PRIMARY KEY,
        first_seen_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS stakes (
        opened_tx     TEXT    NOT NULL,
        opened_log    INTEGER NOT NULL,
        owner         TEXT    NOT NULL,
        pool_id       INTEGER NOT NULL,
        amount        TEXT    NOT NULL,
        block_number  INTEGER NOT NULL,
        staked_at     TEXT    NOT NULL,
        active        INTEGER NOT NULL,
        unstaked_at   TEXT,
        closed_tx     TEXT,
        closed_log    INTEGER,
        reward        TEXT    NOT NULL,
        early_unstake INTEGER NOT NULL,
        PRIMARY KEY (opened_tx, opened_log)
    );",
    "CREATE INDEX IF NOT EXISTS idx_stakes_owner_pool ON stakes (owner, pool_id, active);",
    "CREATE INDEX IF NOT EXISTS idx_stakes_closed_by ON stakes (closed_tx, closed_log);",
    "CREATE TABLE IF NOT EXISTS transactions (
        tx_hash      TEXT    NOT NULL,
        log_index    INTEGER NOT NULL,
        kind         TEXT    NOT NULL,
        owner        TEXT    NOT NULL,
        amount       TEXT    NOT NULL,
        pool_id      INTEGER,
        block_number INTEGER NOT NULL,
        status       TEXT    NOT NULL,
        timestamp    TEXT    NOT NULL,
        PRIMARY KEY (tx_hash, log_index, kind)
    );",
    "CREATE INDEX IF NOT EXISTS idx_transactions_owner ON transactions (owner, block_number);",
    "CREATE TABLE IF NOT EXISTS user_aggregates (
        address       TEXT    PRIMARY KEY,
        total_staked  TEXT    NOT NULL,
        active_stakes INTEGER NOT NULL,
        total_stakes  INTEGER NOT NULL,
        total_rewards TEXT    NOT NULL,
        active_pools  TEXT    NOT NULL,
        updated_at    TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS pools (
        pool_id                   INTEGER PRIMARY KEY,
        min_amount                TEXT,
        max_amount                TEXT,
        apy                       INTEGER,
        lock_period               INTEGER,
        created_block             INTEGER,
        total_staked              TEXT    NOT NULL,
        active_stakes             INTEGER NOT NULL,
        active_stakers            INTEGER NOT NULL,
        total_rewards_distributed TEXT    NOT NULL,
        updated_at                TEXT    NOT NULL
    );",
];

const STAKE_COLUMNS: &str = "opened_tx, opened_log, owner, pool_id, amount, block_number, \
     staked_at, active, unstaked_at, closed_tx, closed_log, reward, early_unstake";

const TX_COLUMNS: &str =
    "tx_hash, log_index, kind, owner, amount, pool_id, block_number, status, timestamp";

const POOL_COLUMNS: &str = "pool_id, min_amount, max_amount, apy, lock_period, created_block, \
     total_staked, active_stakes, active_stakers, total_rewards_distributed, updated_at";

fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(format!("corrupt column {column}: {detail}"))
}

fn amount(row: &SqliteRow, column: &str) -> Result<TokenAmount, IndexerError> {
    let raw: String = row.try_get(column).map_err(db)?;
    raw.parse::<TokenAmount>().map_err(|e| corrupt(column, e))
}

fn opt_amount(row: &SqliteRow, column: &str) -> Result<Option<TokenAmount>, IndexerError> {
    let raw: Option<String> = row.try_get(column).map_err(db)?;
    raw.map(|s| s.parse::<TokenAmount>().map_err(|e| corrupt(column, e)))
        .transpose()
}

fn u64_col(row: &SqliteRow, column: &str) -> Result<u64, IndexerError> {
    let v: i64 = row.try_get(column).map_err(db)?;
    u64::try_from(v).map_err(|e| corrupt(column, e))
}

fn u32_col(row: &SqliteRow, column: &str) -> Result<u32, IndexerError> {
    let v: i64 = row.try_get(column).map_err(db)?;
    u32::try_from(v).map_err(|e| corrupt(column, e))
}

fn raw_event_from_row(row: &SqliteRow) -> Result<RawEvent, IndexerError> {
    let kind: String = row.try_get("kind").map_err(db)?;
    let payload: String = row.try_get("payload").map_err(db)?;
    Ok(RawEvent {
        kind: kind.parse::<EventKind>().map_err(|e| corrupt("kind", e))?,
        contract_address: row.try_get("contract").map_err(db)?,
        tx_hash: row.try_get("tx_hash").map_err(db)?,
        block_number: u64_col(row, "block_number")?,
        block_hash: row.try_get("block_hash").map_err(db)?,
        log_index: u32_col(row, "log_index")?,
        block_timestamp: row.try_get("block_timestamp").map_err(db)?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt("payload", e))?,
    })
}

fn staged_from_row(row: &SqliteRow) -> Result<StagedEvent, IndexerError> {
    Ok(StagedEvent {
        id: row.try_get("id").map_err(db)?,
        event: raw_event_from_row(row)?,
        processed: row.try_get("processed").map_err(db)?,
        note: row.try_get("note").map_err(db)?,
    })
}

fn stake_from_row(row: &SqliteRow) -> Result<Stake, IndexerError> {
    let closed_tx: Option<String> = row.try_get("closed_tx").map_err(db)?;
    let closed_log: Option<i64> = row.try_get("closed_log").map_err(db)?;
    let closed_by = match (closed_tx, closed_log) {
        (Some(tx), Some(log)) => Some(EventId::new(
            tx,
            u32::try_from(log).map_err(|e| corrupt("closed_log", e))?,
        )),
        _ => None,
    };
    Ok(Stake {
        owner: row.try_get("owner").map_err(db)?,
        pool_id: u64_col(row, "pool_id")?,
        amount: amount(row, "amount")?,
        opened_by: EventId::new(
            row.try_get::<String, _>("opened_tx").map_err(db)?,
            u32_col(row, "opened_log")?,
        ),
        block_number: u64_col(row, "block_number")?,
        staked_at: row.try_get("staked_at").map_err(db)?,
        active: row.try_get("active").map_err(db)?,
        unstaked_at: row.try_get("unstaked_at").map_err(db)?,
        closed_by,
        reward: amount(row, "reward")?,
        early_unstake: row.try_get("early_unstake").map_err(db)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, IndexerError> {
    let kind: String = row.try_get("kind").map_err(db)?;
    let status: String = row.try_get("status").map_err(db)?;
    let pool_id: Option<i64> = row.try_get("pool_id").map_err(db)?;
    Ok(Transaction {
        owner: row.try_get("owner").map_err(db)?,
        event: EventId::new(
            row.try_get::<String, _>("tx_hash").map_err(db)?,
            u32_col(row, "log_index")?,
        ),
        kind: TransactionKind::parse(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        amount: amount(row, "amount")?,
        pool_id: pool_id
            .map(|p| u64::try_from(p).map_err(|e| corrupt("pool_id", e)))
            .transpose()?,
        block_number: u64_col(row, "block_number")?,
        status: TransactionStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        timestamp: row.try_get("timestamp").map_err(db)?,
    })
}

fn user_aggregate_from_row(row: &SqliteRow) -> Result<UserAggregate, IndexerError> {
    let pools: String = row.try_get("active_pools").map_err(db)?;
    Ok(UserAggregate {
        address: row.try_get("address").map_err(db)?,
        total_staked: amount(row, "total_staked")?,
        active_stakes: u64_col(row, "active_stakes")?,
        total_stakes: u64_col(row, "total_stakes")?,
        total_rewards: amount(row, "total_rewards")?,
        active_pools: serde_json::from_str(&pools).map_err(|e| corrupt("active_pools", e))?,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn pool_from_row(row: &SqliteRow) -> Result<PoolAggregate, IndexerError> {
    let pool_id = u64_col(row, "pool_id")?;
    let params = match (opt_amount(row, "min_amount")?, opt_amount(row, "max_amount")?) {
        (Some(min_amount), Some(max_amount)) => {
            let apy: Option<i64> = row.try_get("apy").map_err(db)?;
            let lock_period: Option<i64> = row.try_get("lock_period").map_err(db)?;
            let created_block: Option<i64> = row.try_get("created_block").map_err(db)?;
            Some(PoolParams {
                pool_id,
                min_amount,
                max_amount,
                apy: apy.unwrap_or_default() as u64,
                lock_period: lock_period.unwrap_or_default() as u64,
                created_block: created_block.unwrap_or_default() as u64,
            })
        }
        _ => None,
    };
    Ok(PoolAggregate {
        pool_id,
        params,
        total_staked: amount(row, "total_staked")?,
        active_stakes: u64_col(row, "active_stakes")?,
        active_stakers: u64_col(row, "active_stakers")?,
        total_rewards_distributed: amount(row, "total_rewards_distributed")?,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

/// SQLite-backed storage for the event log, cursors and staking tables.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./stakeindex.db"`) or a full
    /// SQLite URL (`"sqlite:./stakeindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection: every `:memory:` connection is a
    /// separate database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        }
        Ok(())
    }

    async fn stakes_where(
        &self,
        filter: &str,
        order: &str,
        binds: StakeFilter<'_>,
    ) -> Result<Vec<Stake>, IndexerError> {
        let sql = format!("SELECT {STAKE_COLUMNS} FROM stakes {filter} {order}");
        let mut query = sqlx::query(&sql);
        query = match binds {
            StakeFilter::All => query,
            StakeFilter::Owner(owner) => query.bind(owner),
            StakeFilter::Pool(pool_id) => query.bind(pool_id as i64),
            StakeFilter::OwnerPool(owner, pool_id) => query.bind(owner).bind(pool_id as i64),
            StakeFilter::ClosedBy(event) => query.bind(&event.tx_hash).bind(event.log_index as i64),
        };
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(stake_from_row).collect()
    }

    async fn transactions_where(
        &self,
        filter: &str,
        owner: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, IndexerError> {
        let limit_clause = match limit {
            Some(n) => format!("LIMIT {n}"),
            None => String::new(),
        };
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM transactions {filter}
             ORDER BY block_number DESC, log_index DESC {limit_clause}"
        );
        let mut query = sqlx::query(&sql);
        if let Some(owner) = owner {
            query = query.bind(owner);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(transaction_from_row).collect()
    }
}

enum StakeFilter<'a> {
    All,
    Owner(&'a str),
    Pool(u64),
    OwnerPool(&'a str, u64),
    ClosedBy(&'a EventId),
}

// ─── EventLogStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl EventLogStore for SqliteStorage {
    async fn append(&self, event: RawEvent) -> Result<AppendOutcome, IndexerError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db)?;

        let existing = sqlx::query(
            "SELECT id, kind, contract, tx_hash, log_index, block_number, block_hash,
                    block_timestamp, payload, processed, note
             FROM events WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let outcome = match existing {
            Some(row) => {
                let stored = staged_from_row(&row)?;
                if stored.event == event {
                    AppendOutcome::Unchanged
                } else {
                    sqlx::query(
                        "UPDATE events
                         SET kind = ?, contract = ?, block_number = ?, block_hash = ?,
                             block_timestamp = ?, payload = ?, processed = 0, note = NULL
                         WHERE id = ?",
                    )
                    .bind(event.kind.name())
                    .bind(&event.contract_address)
                    .bind(event.block_number as i64)
                    .bind(&event.block_hash)
                    .bind(event.block_timestamp)
                    .bind(&payload)
                    .bind(stored.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                    AppendOutcome::Updated
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO events
                     (kind, contract, tx_hash, log_index, block_number, block_hash,
                      block_timestamp, payload)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(event.kind.name())
                .bind(&event.contract_address)
                .bind(&event.tx_hash)
                .bind(event.log_index as i64)
                .bind(event.block_number as i64)
                .bind(&event.block_hash)
                .bind(event.block_timestamp)
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                AppendOutcome::Inserted
            }
        };

        tx.commit().await.map_err(db)?;
        debug!(
            event = %event.kind,
            tx_hash = %event.tx_hash,
            log_index = event.log_index,
            ?outcome,
            "event staged"
        );
        Ok(outcome)
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagedEvent>, IndexerError> {
        let rows = sqlx::query(
            "SELECT id, kind, contract, tx_hash, log_index, block_number, block_hash,
                    block_timestamp, payload, processed, note
             FROM events WHERE processed = 0
             ORDER BY block_number, log_index
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(staged_from_row).collect()
    }

    async fn mark_processed(&self, id: i64) -> Result<(), IndexerError> {
        let done = sqlx::query("UPDATE events SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if done.rows_affected() == 0 {
            return Err(IndexerError::Storage(format!("no staged event with id {id}")));
        }
        Ok(())
    }

    async fn mark_skipped(&self, id: i64, reason: &str) -> Result<(), IndexerError> {
        let done = sqlx::query("UPDATE events SET processed = 1, note = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if done.rows_affected() == 0 {
            return Err(IndexerError::Storage(format!("no staged event with id {id}")));
        }
        Ok(())
    }

    async fn unprocessed_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events WHERE processed = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        u64_col(&row, "cnt")
    }

    async fn total_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        u64_col(&row, "cnt")
    }

    async fn last_processed_block(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(block_number), 0) AS block FROM events WHERE processed = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        u64_col(&row, "block")
    }
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn load(&self, indexer_id: &str) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT block_number FROM cursors WHERE indexer_id = ?")
            .bind(indexer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| u64_col(&r, "block_number")).transpose()
    }

    async fn advance(&self, indexer_id: &str, block: u64) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO cursors (indexer_id, block_number, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (indexer_id) DO UPDATE SET
                 block_number = MAX(block_number, excluded.block_number),
                 updated_at   = excluded.updated_at",
        )
        .bind(indexer_id)
        .bind(block as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        debug!(indexer_id, block, "cursor advanced");
        Ok(())
    }
}

// ─── StakingStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl StakingStore for SqliteStorage {
    async fn ensure_user(&self, address: &str, at: DateTime<Utc>) -> Result<bool, IndexerError> {
        let done = sqlx::query("INSERT OR IGNORE INTO users (address, first_seen_at) VALUES (?, ?)")
            .bind(address)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn insert_stake(&self, stake: &Stake) -> Result<bool, IndexerError> {
        let done = sqlx::query(&format!(
            "INSERT OR IGNORE INTO stakes ({STAKE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&stake.opened_by.tx_hash)
        .bind(stake.opened_by.log_index as i64)
        .bind(&stake.owner)
        .bind(stake.pool_id as i64)
        .bind(stake.amount.to_string())
        .bind(stake.block_number as i64)
        .bind(stake.staked_at)
        .bind(stake.active)
        .bind(stake.unstaked_at)
        .bind(stake.closed_by.as_ref().map(|e| e.tx_hash.clone()))
        .bind(stake.closed_by.as_ref().map(|e| e.log_index as i64))
        .bind(stake.reward.to_string())
        .bind(stake.early_unstake)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn stake_closed_by(&self, event: &EventId) -> Result<Option<Stake>, IndexerError> {
        let mut stakes = self
            .stakes_where(
                "WHERE closed_tx = ? AND closed_log = ?",
                "",
                StakeFilter::ClosedBy(event),
            )
            .await?;
        Ok(stakes.pop())
    }

    async fn active_stakes_in_pool(
        &self,
        owner: &str,
        pool_id: u64,
    ) -> Result<Vec<Stake>, IndexerError> {
        self.stakes_where(
            "WHERE owner = ? AND pool_id = ? AND active = 1",
            "ORDER BY block_number, opened_log",
            StakeFilter::OwnerPool(owner, pool_id),
        )
        .await
    }

    async fn close_stake(
        &self,
        opened_by: &EventId,
        closure: &StakeClosure,
    ) -> Result<bool, IndexerError> {
        let done = sqlx::query(
            "UPDATE stakes
             SET active = 0, unstaked_at = ?, closed_tx = ?, closed_log = ?,
                 reward = ?, early_unstake = ?
             WHERE opened_tx = ? AND opened_log = ? AND active = 1",
        )
        .bind(closure.unstaked_at)
        .bind(&closure.closed_by.tx_hash)
        .bind(closure.closed_by.log_index as i64)
        .bind(closure.reward.to_string())
        .bind(closure.early_unstake())
        .bind(&opened_by.tx_hash)
        .bind(opened_by.log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, IndexerError> {
        let done = sqlx::query(&format!(
            "INSERT OR IGNORE INTO transactions ({TX_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&tx.event.tx_hash)
        .bind(tx.event.log_index as i64)
        .bind(tx.kind.as_str())
        .bind(&tx.owner)
        .bind(tx.amount.to_string())
        .bind(tx.pool_id.map(|p| p as i64))
        .bind(tx.block_number as i64)
        .bind(tx.status.as_str())
        .bind(tx.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn ensure_pool(
        &self,
        params: &PoolParams,
        at: DateTime<Utc>,
    ) -> Result<bool, IndexerError> {
        let inserted = sqlx::query(&format!(
            "INSERT OR IGNORE INTO pools ({POOL_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, '0', 0, 0, '0', ?)"
        ))
        .bind(params.pool_id as i64)
        .bind(params.min_amount.to_string())
        .bind(params.max_amount.to_string())
        .bind(params.apy as i64)
        .bind(params.lock_period as i64)
        .bind(params.created_block as i64)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        // Row created earlier by a stake refresh; fill in the parameters only.
        let filled = sqlx::query(
            "UPDATE pools
             SET min_amount = ?, max_amount = ?, apy = ?, lock_period = ?,
                 created_block = ?, updated_at = ?
             WHERE pool_id = ? AND min_amount IS NULL",
        )
        .bind(params.min_amount.to_string())
        .bind(params.max_amount.to_string())
        .bind(params.apy as i64)
        .bind(params.lock_period as i64)
        .bind(params.created_block as i64)
        .bind(at)
        .bind(params.pool_id as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(filled.rows_affected() == 1)
    }

    async fn refresh_user_aggregate(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<UserAggregate, IndexerError> {
        let stakes = self
            .stakes_where("WHERE owner = ?", "", StakeFilter::Owner(address))
            .await?;
        let txs = self
            .transactions_where("WHERE owner = ?", Some(address), None)
            .await?;
        let agg = aggregate::user_aggregate(address, &stakes, &txs, at);

        let pools = serde_json::to_string(&agg.active_pools)
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO user_aggregates
             (address, total_staked, active_stakes, total_stakes, total_rewards,
              active_pools, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (address) DO UPDATE SET
                 total_staked  = excluded.total_staked,
                 active_stakes = excluded.active_stakes,
                 total_stakes  = excluded.total_stakes,
                 total_rewards = excluded.total_rewards,
                 active_pools  = excluded.active_pools,
                 updated_at    = excluded.updated_at",
        )
        .bind(&agg.address)
        .bind(agg.total_staked.to_string())
        .bind(agg.active_stakes as i64)
        .bind(agg.total_stakes as i64)
        .bind(agg.total_rewards.to_string())
        .bind(&pools)
        .bind(agg.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(agg)
    }

    async fn refresh_pool_aggregate(
        &self,
        pool_id: u64,
        at: DateTime<Utc>,
    ) -> Result<PoolAggregate, IndexerError> {
        let params = self.pool_aggregate(pool_id).await?.and_then(|p| p.params);
        let stakes = self
            .stakes_where("WHERE pool_id = ?", "", StakeFilter::Pool(pool_id))
            .await?;
        let agg = aggregate::pool_aggregate(pool_id, params, &stakes, at);

        sqlx::query(&format!(
            "INSERT INTO pools ({POOL_COLUMNS})
             VALUES (?, NULL, NULL, NULL, NULL, NULL, ?, ?, ?, ?, ?)
             ON CONFLICT (pool_id) DO UPDATE SET
                 total_staked              = excluded.total_staked,
                 active_stakes             = excluded.active_stakes,
                 active_stakers            = excluded.active_stakers,
                 total_rewards_distributed = excluded.total_rewards_distributed,
                 updated_at                = excluded.updated_at"
        ))
        .bind(pool_id as i64)
        .bind(agg.total_staked.to_string())
        .bind(agg.active_stakes as i64)
        .bind(agg.active_stakers as i64)
        .bind(agg.total_rewards_distributed.to_string())
        .bind(agg.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(agg)
    }
}

// ─── StakingReader impl ──────────────────────────────────────────────────────

#[async_trait]
impl StakingReader for SqliteStorage {
    async fn user_aggregate(&self, address: &str) -> Result<Option<UserAggregate>, IndexerError> {
        let row = sqlx::query("SELECT * FROM user_aggregates WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(user_aggregate_from_row).transpose()
    }

    async fn pool_aggregate(&self, pool_id: u64) -> Result<Option<PoolAggregate>, IndexerError> {
        let row = sqlx::query(&format!("SELECT {POOL_COLUMNS} FROM pools WHERE pool_id = ?"))
            .bind(pool_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn pools(&self) -> Result<Vec<PoolAggregate>, IndexerError> {
        let rows = sqlx::query(&format!("SELECT {POOL_COLUMNS} FROM pools ORDER BY pool_id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(pool_from_row).collect()
    }

    async fn active_stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError> {
        self.stakes_where(
            "WHERE owner = ? AND active = 1",
            "ORDER BY block_number DESC, opened_log DESC",
            StakeFilter::Owner(owner),
        )
        .await
    }

    async fn stakes(&self, owner: &str) -> Result<Vec<Stake>, IndexerError> {
        self.stakes_where(
            "WHERE owner = ?",
            "ORDER BY block_number DESC, opened_log DESC",
            StakeFilter::Owner(owner),
        )
        .await
    }

    async fn recent_transactions(
        &self,
        limit: usize,
        owner: Option<&str>,
    ) -> Result<Vec<Transaction>, IndexerError> {
        let filter = if owner.is_some() { "WHERE owner = ?" } else { "" };
        self.transactions_where(filter, owner, Some(limit)).await
    }

    async fn top_stakers(&self, limit: usize) -> Result<Vec<UserAggregate>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM user_aggregates WHERE total_staked <> '0'")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let users = rows
            .iter()
            .map(user_aggregate_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aggregate::rank_stakers(users, limit))
    }

    async fn platform_stats(&self) -> Result<PlatformStats, IndexerError> {
        let users = sqlx::query("SELECT COUNT(*) AS cnt FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        let pools = sqlx::query("SELECT COUNT(*) AS cnt FROM pools")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        let stakes = self.stakes_where("", "", StakeFilter::All).await?;
        let rewards = self
            .transactions_where("WHERE kind = 'reward'", None, None)
            .await?;

        Ok(aggregate::platform_stats(
            u64_col(&users, "cnt")?,
            u64_col(&pools, "cnt")?,
            &stakes,
            &rewards,
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
