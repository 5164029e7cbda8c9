//! [`ChainClient`] over an EVM JSON-RPC node.
//!
//! Turns `eth_getLogs` output for the staking contract into [`RawEvent`]s:
//! drops removed and pending logs, decodes arguments into the camelCase
//! payload, attaches block timestamps and sorts by chain position.
//! A log whose arguments cannot be decoded is still staged, with the raw
//! topics and data as payload, so the apply loop records it as skipped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::json;

use stakeindex_core::chain::ChainClient;
use stakeindex_core::error::IndexerError;
use stakeindex_core::types::{EventKind, RawEvent};

use crate::abi::decode_log;
use crate::fetcher::{EvmRpcClient, RawLog};

/// Block timestamps kept between calls; cleared when it grows past this.
const TIMESTAMP_CACHE_LIMIT: usize = 4_096;

/// Reads staking events for one contract.
pub struct EvmChainClient<R> {
    rpc: R,
    contract: String,
    timestamps: Mutex<HashMap<u64, i64>>,
}

impl<R: EvmRpcClient> EvmChainClient<R> {
    /// `contract` is matched case-insensitively against log addresses.
    pub fn new(rpc: R, contract: impl Into<String>) -> Self {
        Self {
            rpc,
            contract: contract.into().to_ascii_lowercase(),
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    fn cached(&self, block: u64) -> Option<i64> {
        self.timestamps
            .lock()
            .ok()
            .and_then(|cache| cache.get(&block).copied())
    }

    fn remember(&self, found: &[(u64, i64)]) {
        if let Ok(mut cache) = self.timestamps.lock() {
            if cache.len() + found.len() > TIMESTAMP_CACHE_LIMIT {
                cache.clear();
            }
            cache.extend(found.iter().copied());
        }
    }

    /// Timestamps for every block in `blocks`, fetched concurrently for
    /// blocks not seen before.
    async fn block_timestamps(
        &self,
        blocks: &BTreeSet<u64>,
    ) -> Result<HashMap<u64, i64>, IndexerError> {
        let mut out = HashMap::with_capacity(blocks.len());
        let mut missing = Vec::new();
        for &block in blocks {
            match self.cached(block) {
                Some(ts) => {
                    out.insert(block, ts);
                }
                None => missing.push(block),
            }
        }

        let fetched = try_join_all(missing.iter().map(|&block| async move {
            match self.rpc.get_block_timestamp(block).await {
                Ok(Some(ts)) => Ok((block, ts)),
                Ok(None) => Err(IndexerError::Rpc(format!("block {block} not found"))),
                Err(e) => Err(e),
            }
        }))
        .await?;

        self.remember(&fetched);
        out.extend(fetched);
        Ok(out)
    }

    fn accept(&self, kind: EventKind, log: &RawLog) -> Option<(u64, u32, String, String)> {
        if log.is_removed() {
            tracing::debug!(tx_hash = ?log.tx_hash, "dropping removed log");
            return None;
        }
        let (Some(block), Some(index), Some(tx_hash), Some(block_hash)) = (
            log.block_number_u64(),
            log.log_index_u32(),
            log.tx_hash.clone(),
            log.block_hash.clone(),
        ) else {
            tracing::warn!(event = %kind, ?log, "dropping log without a chain position");
            return None;
        };
        if !log.address.eq_ignore_ascii_case(&self.contract) {
            tracing::warn!(
                event = %kind,
                address = %log.address,
                "dropping log from another contract"
            );
            return None;
        }
        Some((block, index, tx_hash.to_ascii_lowercase(), block_hash))
    }
}

#[async_trait]
impl<R: EvmRpcClient> ChainClient for EvmChainClient<R> {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        self.rpc.get_block_number().await
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, IndexerError> {
        if from > to {
            return Ok(Vec::new());
        }
        let head = self.rpc.get_block_number().await?;
        if from > head {
            tracing::debug!(event = %kind, from, head, "range starts past the head");
            return Ok(Vec::new());
        }
        let to = to.min(head);

        let logs = self
            .rpc
            .get_logs(from, to, &self.contract, &kind.topic0())
            .await?;

        let accepted: Vec<_> = logs
            .iter()
            .filter_map(|log| self.accept(kind, log).map(|pos| (pos, log)))
            .collect();

        let blocks: BTreeSet<u64> = accepted.iter().map(|((block, ..), _)| *block).collect();
        let timestamps = self.block_timestamps(&blocks).await?;

        let mut events = Vec::with_capacity(accepted.len());
        for ((block, log_index, tx_hash, block_hash), log) in accepted {
            let payload = match decode_log(kind, &log.topics, &log.data) {
                Ok(decoded) => decoded.to_payload(),
                Err(e) => {
                    tracing::warn!(
                        event = %kind,
                        %tx_hash,
                        log_index,
                        error = %e,
                        "undecodable log; staging raw topics"
                    );
                    json!({
                        "topics": log.topics,
                        "data": log.data,
                        "decodeError": e.to_string(),
                    })
                }
            };
            events.push(RawEvent {
                kind,
                contract_address: self.contract.clone(),
                tx_hash,
                block_number: block,
                block_hash,
                log_index,
                block_timestamp: timestamps.get(&block).copied().unwrap_or_default(),
                payload,
            });
        }

        events.sort_by_key(RawEvent::position);
        tracing::debug!(event = %kind, from, to, count = events.len(), "fetched logs");
        Ok(events)
    }
}
