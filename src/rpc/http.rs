//! Alloy HTTP implementation of [`ChainClient`].
//!
//! Blocks and receipts are fetched with `raw_request` and decoded straight
//! into the indexer's own chain types; `getOwners` goes through the
//! `sol!`-generated Gnosis Safe binding.
//!
//! ## Example
//!
//! ```no_run
//! use circles_indexer::chain::ChainClient;
//! use circles_indexer::rpc::AlloyChainClient;
//! use circles_indexer::error::IndexerResult;
//!
//! # async fn example() -> IndexerResult<()> {
//! let client = AlloyChainClient::connect("https://rpc.gnosischain.com")?;
//! let head = client.chain_height().await?;
//! println!("Chain head: {head}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, B256, U64};
use alloy::providers::{Provider as _, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::WrapErr;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::chain::{ChainBlock, ChainClient, ChainConnector, TxReceipt};
use crate::error::{IndexerError, IndexerResult};
use crate::events::IGnosisSafe;

/// Plain HTTP provider without fillers; the indexer never sends transactions.
pub type Provider = RootProvider<Http<Client>>;

/// Strip credentials and path segments from an RPC URL before logging it.
#[must_use]
pub fn redact_url(rpc_url: &str) -> &str {
    let without_scheme = rpc_url.split("://").nth(1).unwrap_or(rpc_url);
    without_scheme.split('/').next().unwrap_or("unknown")
}

/// Create an HTTP provider for `rpc_url`.
///
/// # Errors
///
/// Returns [`IndexerError::RpcError`] if the URL cannot be parsed.
#[instrument(skip(rpc_url), fields(rpc_host = tracing::field::Empty))]
pub fn create_provider(rpc_url: &str) -> IndexerResult<Provider> {
    let host = redact_url(rpc_url);
    tracing::Span::current().record("rpc_host", host);

    let url = rpc_url.parse().map_err(|e| {
        IndexerError::rpc(
            format!("Failed to parse RPC URL for host '{host}'"),
            Some(Box::new(e)),
        )
    })?;

    debug!(rpc_host = host, "Creating HTTP provider");
    Ok(ProviderBuilder::new().on_http(url))
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    hash: B256,
}

/// [`ChainClient`] backed by an alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct AlloyChainClient {
    provider: Provider,
}

impl AlloyChainClient {
    /// Wrap an existing provider.
    #[must_use]
    pub const fn new(provider: Provider) -> Self {
        Self { provider }
    }

    /// Create a client for `rpc_url`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::RpcError`] if the URL cannot be parsed.
    pub fn connect(rpc_url: &str) -> IndexerResult<Self> {
        create_provider(rpc_url).map(Self::new)
    }

    /// Chain id reported by the node; doubles as a liveness probe.
    async fn chain_id(&self) -> eyre::Result<u64> {
        self.provider
            .get_chain_id()
            .await
            .wrap_err("eth_chainId failed")
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    #[instrument(skip(self), fields(block = tracing::field::Empty))]
    async fn chain_height(&self) -> IndexerResult<u64> {
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| IndexerError::rpc("Failed to fetch chain height", Some(Box::new(e))))?;
        tracing::Span::current().record("block", height);
        Ok(height)
    }

    #[instrument(
        skip(self),
        fields(transactions = tracing::field::Empty, duration_ms = tracing::field::Empty)
    )]
    async fn block_with_transactions(&self, height: u64) -> IndexerResult<Option<ChainBlock>> {
        let start = Instant::now();
        let block: Option<ChainBlock> = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), (U64::from(height), true))
            .await
            .map_err(|e| {
                IndexerError::rpc(format!("Failed to fetch block {height}"), Some(Box::new(e)))
            })?;

        let span = tracing::Span::current();
        span.record("duration_ms", u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        if let Some(ref block) = block {
            span.record("transactions", block.transactions.len());
        }
        Ok(block)
    }

    #[instrument(skip(self))]
    async fn block_hash(&self, height: u64) -> IndexerResult<Option<B256>> {
        let header: Option<BlockHeader> = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), (U64::from(height), false))
            .await
            .map_err(|e| {
                IndexerError::rpc(
                    format!("Failed to fetch header of block {height}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(header.map(|h| h.hash))
    }

    #[instrument(skip(self))]
    async fn transaction_receipt(&self, hash: B256) -> IndexerResult<Option<TxReceipt>> {
        self.provider
            .raw_request("eth_getTransactionReceipt".into(), (hash,))
            .await
            .map_err(|e| {
                IndexerError::rpc(format!("Failed to fetch receipt {hash}"), Some(Box::new(e)))
            })
    }

    #[instrument(skip(self))]
    async fn safe_owners(&self, safe: Address) -> IndexerResult<Vec<Address>> {
        let safe_contract = IGnosisSafe::new(safe, self.provider.clone());
        let owners = safe_contract.getOwners().call().await.map_err(|e| {
            IndexerError::rpc(format!("getOwners failed for {safe}"), Some(Box::new(e)))
        })?;
        Ok(owners._0)
    }
}

/// Opens a new [`AlloyChainClient`] for every round.
#[derive(Debug, Clone)]
pub struct AlloyConnector {
    rpc_url: String,
}

impl AlloyConnector {
    /// Connector for `rpc_url`.
    #[must_use]
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
        }
    }
}

#[async_trait]
impl ChainConnector for AlloyConnector {
    async fn connect(&self) -> IndexerResult<Arc<dyn ChainClient>> {
        let client = AlloyChainClient::connect(&self.rpc_url)?;
        let chain_id = client.chain_id().await?;
        info!(rpc_host = redact_url(&self.rpc_url), chain_id, "Chain client connected");
        Ok(Arc::new(client))
    }
}
