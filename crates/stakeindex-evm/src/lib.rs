//! stakeindex-evm: EVM JSON-RPC transport and staking log decoder.
//!
//! ```text
//! HttpRpcClient (reqwest + retry) ──► EvmRpcClient ──► EvmChainClient ──► ChainClient
//!                                      eth_getLogs       abi::decode_log
//! ```

pub mod abi;
pub mod client;
pub mod fetcher;
pub mod rpc;

pub use client::EvmChainClient;
pub use fetcher::{EvmRpcClient, RawLog};
pub use rpc::{HttpClientConfig, HttpRpcClient, RetryConfig, TransportError};

use stakeindex_core::config::IndexerConfig;

/// Connect an HTTP chain client for the contract named in `config`.
pub fn http_chain_client(
    rpc_url: &str,
    config: &IndexerConfig,
) -> Result<EvmChainClient<HttpRpcClient>, TransportError> {
    let rpc = HttpRpcClient::new(
        rpc_url,
        HttpClientConfig::within(config.rpc_timeout(), RetryConfig::default()),
    )?;
    Ok(EvmChainClient::new(rpc, config.contract_address.clone()))
}
