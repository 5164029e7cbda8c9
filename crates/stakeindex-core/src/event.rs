//! Typed staking events decoded from staged payloads.
//!
//! The chain client writes each log's arguments into [`RawEvent::payload`] as
//! camelCase JSON with integers as base-10 strings. [`StakingEvent::decode`]
//! turns that back into one variant per event kind so the apply loop can match
//! on it.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;
use crate::error::IndexerError;
use crate::types::{EventKind, RawEvent};

/// A decoded staking contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakingEvent {
    Staked(StakedArgs),
    Unstaked(UnstakedArgs),
    RewardClaimed(RewardClaimedArgs),
    PoolCreated(PoolCreatedArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakedArgs {
    pub user: String,
    #[serde(deserialize_with = "u64_from_str_or_num", serialize_with = "u64_as_str")]
    pub pool_id: u64,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstakedArgs {
    pub user: String,
    #[serde(deserialize_with = "u64_from_str_or_num", serialize_with = "u64_as_str")]
    pub pool_id: u64,
    pub amount: TokenAmount,
    pub reward: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaimedArgs {
    pub user: String,
    pub amount: TokenAmount,
    #[serde(
        default,
        deserialize_with = "opt_u64_from_str_or_num",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCreatedArgs {
    #[serde(deserialize_with = "u64_from_str_or_num", serialize_with = "u64_as_str")]
    pub pool_id: u64,
    pub min_amount: TokenAmount,
    pub max_amount: TokenAmount,
    #[serde(deserialize_with = "u64_from_str_or_num", serialize_with = "u64_as_str")]
    pub apy: u64,
    #[serde(deserialize_with = "u64_from_str_or_num", serialize_with = "u64_as_str")]
    pub lock_period: u64,
}

impl StakingEvent {
    /// Decode the payload of a staged event according to its kind.
    ///
    /// Addresses are normalized to lowercase. Any missing or ill-typed field
    /// yields [`IndexerError::MalformedEvent`].
    pub fn decode(raw: &RawEvent) -> Result<Self, IndexerError> {
        let event = match raw.kind {
            EventKind::Staked => {
                let mut args: StakedArgs = payload(raw)?;
                args.user = normalize_address(raw, &args.user)?;
                Self::Staked(args)
            }
            EventKind::Unstaked => {
                let mut args: UnstakedArgs = payload(raw)?;
                args.user = normalize_address(raw, &args.user)?;
                Self::Unstaked(args)
            }
            EventKind::RewardClaimed => {
                let mut args: RewardClaimedArgs = payload(raw)?;
                args.user = normalize_address(raw, &args.user)?;
                Self::RewardClaimed(args)
            }
            EventKind::PoolCreated => Self::PoolCreated(payload(raw)?),
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Staked(_) => EventKind::Staked,
            Self::Unstaked(_) => EventKind::Unstaked,
            Self::RewardClaimed(_) => EventKind::RewardClaimed,
            Self::PoolCreated(_) => EventKind::PoolCreated,
        }
    }

    /// Serialize the arguments back into the staged payload shape.
    pub fn to_payload(&self) -> serde_json::Value {
        let value = match self {
            Self::Staked(a) => serde_json::to_value(a),
            Self::Unstaked(a) => serde_json::to_value(a),
            Self::RewardClaimed(a) => serde_json::to_value(a),
            Self::PoolCreated(a) => serde_json::to_value(a),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

fn payload<T: DeserializeOwned>(raw: &RawEvent) -> Result<T, IndexerError> {
    serde_json::from_value(raw.payload.clone()).map_err(|e| malformed(raw, e.to_string()))
}

fn malformed(raw: &RawEvent, reason: impl Into<String>) -> IndexerError {
    IndexerError::MalformedEvent {
        tx_hash: raw.tx_hash.clone(),
        log_index: raw.log_index,
        reason: reason.into(),
    }
}

/// Lowercase a `0x`-prefixed 20-byte hex address.
pub fn normalize_address(raw: &RawEvent, address: &str) -> Result<String, IndexerError> {
    let hex = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .ok_or_else(|| malformed(raw, format!("address without 0x prefix: {address}")))?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed(raw, format!("invalid address: {address}")));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNum {
    Str(String),
    Num(u64),
}

fn u64_from_str_or_num<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match StrOrNum::deserialize(d)? {
        StrOrNum::Num(n) => Ok(n),
        StrOrNum::Str(s) => s.trim().parse::<u64>().map_err(de::Error::custom),
    }
}

fn opt_u64_from_str_or_num<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    u64_from_str_or_num(d).map(Some)
}

fn u64_as_str<S: serde::Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}
