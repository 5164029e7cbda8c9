//! stakeindexd: run and inspect the staking event indexer.
//!
//! Usage:
//! ```bash
//! stakeindexd run    --config stakeindex.yaml
//! stakeindexd status --config stakeindex.yaml
//! stakeindexd sync
//! stakeindexd info
//! ```

mod config;
mod logging;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use stakeindex_core::{
    BroadcastNotifier, Clock, Indexer, IndexerState, IndexerStatus, IndexerStore,
    StakeNotification, SystemClock,
};
use stakeindex_evm::http_chain_client;
use stakeindex_storage::{InMemoryStorage, SqliteStorage};

use crate::config::DaemonConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Status,
    Sync,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let command = match args[1].as_str() {
        "run" => Command::Run,
        "status" => Command::Status,
        "sync" => Command::Sync,
        "info" => return cmd_info(),
        "version" | "--version" | "-V" => {
            println!("stakeindexd {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        "help" | "--help" | "-h" => return print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    let config_path = match parse_config_flag(&args[2..]) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(command, config_path)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_config_flag(args: &[String]) -> Result<Option<PathBuf>> {
    let mut path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => match iter.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("--config requires a path"),
            },
            other => bail!("Unknown argument: {other}"),
        }
    }
    Ok(path)
}

fn print_usage() {
    println!("stakeindexd {}", env!("CARGO_PKG_VERSION"));
    println!("Staking contract event indexer\n");
    println!("USAGE:");
    println!("    stakeindexd <COMMAND> [--config <FILE>]\n");
    println!("COMMANDS:");
    println!("    run      Catch up, then index until Ctrl-C");
    println!("    status   Print indexing progress as JSON");
    println!("    sync     Run one fetch and apply cycle, then exit");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("ENVIRONMENT:");
    println!("    RPC_URL, STAKING_CONTRACT_ADDRESS, DEPLOYMENT_BLOCK, DATABASE_URL, LOG_LEVEL");
}

fn cmd_info() {
    let defaults = DaemonConfig::default();
    println!("stakeindexd v{}", env!("CARGO_PKG_VERSION"));
    println!("  Events: PoolCreated, Staked, Unstaked, RewardClaimed");
    println!("  Default chunk size: {} blocks/call", defaults.indexer.chunk_size);
    println!(
        "  Default fetch interval: {}s",
        defaults.indexer.fetch_interval_ms / 1000
    );
    println!(
        "  Default apply interval: {}s ({} events/tick)",
        defaults.indexer.apply_interval_ms / 1000,
        defaults.indexer.apply_batch_size
    );
    println!("  Storage backends: SQLite (default), memory");
}

async fn execute(command: Command, config_path: Option<PathBuf>) -> Result<()> {
    let config = DaemonConfig::load(config_path.as_deref())?;
    logging::init_tracing(&config.log);

    if config.uses_memory_store() {
        tracing::warn!("using in-memory storage; nothing will be persisted");
        let store = Arc::new(InMemoryStorage::new());
        dispatch(command, config, store).await
    } else {
        let store = SqliteStorage::open(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        dispatch(command, config, Arc::new(store)).await
    }
}

async fn dispatch<S>(command: Command, config: DaemonConfig, store: Arc<S>) -> Result<()>
where
    S: IndexerStore + 'static,
{
    match command {
        Command::Run => cmd_run(config, store).await,
        Command::Status => cmd_status(config, store).await,
        Command::Sync => cmd_sync(config, store).await,
    }
}

async fn cmd_run<S>(config: DaemonConfig, store: Arc<S>) -> Result<()>
where
    S: IndexerStore + 'static,
{
    let client = http_chain_client(&config.rpc_url, &config.indexer)
        .with_context(|| format!("connecting to {}", config.rpc_url))?;
    let notifier = Arc::new(BroadcastNotifier::new(config.notify_capacity));
    let forwarder = tokio::spawn(log_notifications(notifier.subscribe()));

    let indexer = Indexer::with_parts(
        config.indexer,
        Arc::new(client),
        store,
        notifier,
        Arc::new(SystemClock),
    )?;
    indexer.start().await.context("starting indexer")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    indexer.stop().await;
    forwarder.abort();

    let status = indexer.status().await?;
    tracing::info!(
        last_processed_block = status.last_processed_block,
        last_fetched_block = ?status.last_fetched_block,
        unprocessed_events = status.unprocessed_events,
        "final status"
    );
    Ok(())
}

async fn cmd_status<S>(config: DaemonConfig, store: Arc<S>) -> Result<()>
where
    S: IndexerStore + 'static,
{
    let status = IndexerStatus::read(
        store.as_ref(),
        &config.indexer.id,
        false,
        IndexerState::Idle,
        SystemClock.now(),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_sync<S>(config: DaemonConfig, store: Arc<S>) -> Result<()>
where
    S: IndexerStore + 'static,
{
    let client = http_chain_client(&config.rpc_url, &config.indexer)
        .with_context(|| format!("connecting to {}", config.rpc_url))?;
    let indexer = Indexer::new(config.indexer, Arc::new(client), store)?;

    let report = indexer.sync_once().await?;
    tracing::info!(
        caught_up = report.fetch.is_caught_up(),
        applied = report.apply.applied,
        skipped = report.apply.skipped,
        "sync complete"
    );

    let status = indexer.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Write every notification to the log as JSON until the channel closes.
async fn log_notifications(mut rx: broadcast::Receiver<StakeNotification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(json) => tracing::info!(notification = %json, "stake notification"),
                Err(e) => tracing::warn!(error = %e, "unserializable notification"),
            },
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "notification log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
