//! ABI decoding for the staking contract's events.
//!
//! | Event           | Indexed topics    | Data words                             |
//! |-----------------|-------------------|----------------------------------------|
//! | `PoolCreated`   | `poolId`          | `minAmount, maxAmount, apy, lockPeriod`|
//! | `Staked`        | `user, poolId`    | `amount`                               |
//! | `Unstaked`      | `user, poolId`    | `amount, reward`                       |
//! | `RewardClaimed` | `user`            | `amount, timestamp`                    |

use alloy_primitives::{hex, Address, B256, U256};

use stakeindex_core::amount::TokenAmount;
use stakeindex_core::event::{
    PoolCreatedArgs, RewardClaimedArgs, StakedArgs, StakingEvent, UnstakedArgs,
};
use stakeindex_core::types::EventKind;

/// Why a log could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("expected {expected} topics, got {got}")]
    TopicCount { expected: usize, got: usize },
    #[error("topic0 {0} does not match the event signature")]
    WrongSignature(String),
    #[error("invalid topic {0}")]
    InvalidTopic(String),
    #[error("invalid data hex: {0}")]
    InvalidData(String),
    #[error("expected {expected} data words, got {got} bytes")]
    DataLength { expected: usize, got: usize },
    #[error("{field} does not fit in 64 bits")]
    Overflow { field: &'static str },
}

/// Decode the arguments of a staking log of the given kind.
pub fn decode_log(kind: EventKind, topics: &[String], data: &str) -> Result<StakingEvent, AbiError> {
    let indexed = match kind {
        EventKind::PoolCreated | EventKind::RewardClaimed => 1,
        EventKind::Staked | EventKind::Unstaked => 2,
    };
    if topics.len() != indexed + 1 {
        return Err(AbiError::TopicCount {
            expected: indexed + 1,
            got: topics.len(),
        });
    }
    let topic0 = word(&topics[0])?;
    if hex::encode_prefixed(topic0) != kind.topic0() {
        return Err(AbiError::WrongSignature(topics[0].clone()));
    }

    let words = data_words(data)?;
    let need = |n: usize| -> Result<(), AbiError> {
        if words.len() < n {
            Err(AbiError::DataLength {
                expected: n,
                got: words.len() * 32,
            })
        } else {
            Ok(())
        }
    };

    let event = match kind {
        EventKind::Staked => {
            need(1)?;
            StakingEvent::Staked(StakedArgs {
                user: address(&word(&topics[1])?),
                pool_id: small(U256::from_be_bytes(word(&topics[2])?.0), "poolId")?,
                amount: TokenAmount::new(words[0]),
            })
        }
        EventKind::Unstaked => {
            need(2)?;
            StakingEvent::Unstaked(UnstakedArgs {
                user: address(&word(&topics[1])?),
                pool_id: small(U256::from_be_bytes(word(&topics[2])?.0), "poolId")?,
                amount: TokenAmount::new(words[0]),
                reward: TokenAmount::new(words[1]),
            })
        }
        EventKind::RewardClaimed => {
            need(2)?;
            StakingEvent::RewardClaimed(RewardClaimedArgs {
                user: address(&word(&topics[1])?),
                amount: TokenAmount::new(words[0]),
                timestamp: Some(small(words[1], "timestamp")?),
            })
        }
        EventKind::PoolCreated => {
            need(4)?;
            StakingEvent::PoolCreated(PoolCreatedArgs {
                pool_id: small(U256::from_be_bytes(word(&topics[1])?.0), "poolId")?,
                min_amount: TokenAmount::new(words[0]),
                max_amount: TokenAmount::new(words[1]),
                apy: small(words[2], "apy")?,
                lock_period: small(words[3], "lockPeriod")?,
            })
        }
    };
    Ok(event)
}

fn word(topic: &str) -> Result<B256, AbiError> {
    topic
        .parse::<B256>()
        .map_err(|_| AbiError::InvalidTopic(topic.to_string()))
}

fn address(topic: &B256) -> String {
    hex::encode_prefixed(Address::from_word(*topic).as_slice())
}

fn small(value: U256, field: &'static str) -> Result<u64, AbiError> {
    u64::try_from(value).map_err(|_| AbiError::Overflow { field })
}

fn data_words(data: &str) -> Result<Vec<U256>, AbiError> {
    let bytes = hex::decode(data).map_err(|e| AbiError::InvalidData(e.to_string()))?;
    if bytes.len() % 32 != 0 {
        return Err(AbiError::DataLength {
            expected: bytes.len().div_ceil(32),
            got: bytes.len(),
        });
    }
    Ok(bytes.chunks_exact(32).map(U256::from_be_slice).collect())
}
