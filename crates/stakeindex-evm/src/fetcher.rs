//! EVM log and block fetcher.
//!
//! Uses JSON-RPC `eth_blockNumber`, `eth_getBlockByNumber` and `eth_getLogs`
//! filtered by contract address and `topic0`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stakeindex_core::error::IndexerError;

use crate::rpc::{HttpRpcClient, TransportError};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "blockHash")]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: Option<String>,
    #[serde(rename = "logIndex")]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Block number, if the log is mined and the field is valid hex.
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    pub fn log_index_u32(&self) -> Option<u32> {
        self.log_index
            .as_deref()
            .and_then(parse_hex_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// Read access to an EVM node.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, IndexerError>;

    /// Unix timestamp of block `number`, or `None` if the node does not
    /// know the block.
    async fn get_block_timestamp(&self, number: u64) -> Result<Option<i64>, IndexerError>;

    /// Logs emitted by `address` in `[from, to]` whose first topic is `topic0`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        address: &str,
        topic0: &str,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn quantity(n: u64) -> Value {
    Value::String(format!("0x{n:x}"))
}

fn unexpected(method: &str, value: &Value) -> IndexerError {
    IndexerError::Rpc(format!("{method}: unexpected result {value}"))
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn get_block_number(&self) -> Result<u64, IndexerError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| unexpected("eth_blockNumber", &value))
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<Option<i64>, IndexerError> {
        let value = self
            .call("eth_getBlockByNumber", vec![quantity(number), json!(false)])
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let ts = value["timestamp"]
            .as_str()
            .and_then(parse_hex_u64)
            .and_then(|t| i64::try_from(t).ok())
            .ok_or_else(|| unexpected("eth_getBlockByNumber", &value["timestamp"]))?;
        Ok(Some(ts))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        address: &str,
        topic0: &str,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let filter = json!({
            "fromBlock": quantity(from),
            "toBlock": quantity(to),
            "address": address,
            "topics": [topic0],
        });
        let value = self.call("eth_getLogs", vec![filter]).await?;
        let logs: Vec<RawLog> =
            serde_json::from_value(value).map_err(|e| IndexerError::from(TransportError::from(e)))?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn raw_log_from_node_json() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC",
            "topics": ["0x1449c6dd7851abc30abf37f57715f492010519147cc2652fbc38202c18a6ee90"],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "blockHash": "0xabc",
            "transactionHash": "0xdef",
            "logIndex": "0x5",
            "transactionIndex": "0x0"
        }))
        .unwrap();
        assert_eq!(log.block_number_u64(), Some(5_000_000_000));
        assert_eq!(log.log_index_u32(), Some(5));
        assert!(!log.is_removed());
    }

    #[test]
    fn pending_log_has_no_position() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0x0",
            "topics": [],
            "data": "0x",
            "blockNumber": null,
            "blockHash": null,
            "transactionHash": null,
            "logIndex": null,
            "removed": false
        }))
        .unwrap();
        assert_eq!(log.block_number_u64(), None);
        assert_eq!(log.log_index_u32(), None);
    }
}
