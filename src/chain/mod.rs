//! Chain data model and the node client abstraction.
//!
//! The types mirror the JSON-RPC shapes of `eth_getBlockByNumber` (with full
//! transaction objects) and `eth_getTransactionReceipt`, keeping only the
//! fields the indexer persists or classifies on. Hex quantities are decoded
//! into native integers at deserialisation time.
//!
//! [`ChainClient`] is the seam between the pipeline and the node: the alloy
//! implementation lives in [`crate::rpc`], tests plug in an in-memory chain.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};

use crate::error::IndexerResult;

fn quantity<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    U64::deserialize(deserializer).map(|value| value.to::<u64>())
}

fn optional_quantity<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<U64>::deserialize(deserializer).map(|value| value.map(|v| v.to::<u64>()))
}

/// A block with its full transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBlock {
    /// Block height
    #[serde(deserialize_with = "quantity")]
    pub number: u64,
    /// Block hash
    pub hash: B256,
    /// Unix timestamp in seconds
    #[serde(deserialize_with = "quantity")]
    pub timestamp: u64,
    /// Transactions in block order
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
}

/// A mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    /// Transaction hash
    pub hash: B256,
    /// Height of the including block
    #[serde(deserialize_with = "quantity")]
    pub block_number: u64,
    /// Position within the block
    #[serde(deserialize_with = "quantity")]
    pub transaction_index: u64,
    /// Sender
    pub from: Address,
    /// Recipient, `None` for contract creation
    #[serde(default)]
    pub to: Option<Address>,
    /// Transferred wei
    pub value: U256,
    /// Call data
    #[serde(default)]
    pub input: Bytes,
    /// Sender nonce
    #[serde(deserialize_with = "quantity")]
    pub nonce: u64,
    /// EIP-2718 envelope type (0 for legacy)
    #[serde(rename = "type", default, deserialize_with = "optional_quantity")]
    pub tx_type: Option<u64>,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Hash of the transaction this receipt belongs to
    pub transaction_hash: B256,
    /// 1 = success, 0 = reverted; absent before Byzantium
    #[serde(default, deserialize_with = "optional_quantity")]
    pub status: Option<u64>,
    /// Created contract, if any
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Emitted logs in order
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

/// A single log entry of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLog {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics, topic 0 is the event signature
    pub topics: Vec<B256>,
    /// Non-indexed payload
    #[serde(default)]
    pub data: Bytes,
    /// Position of the log within the block
    #[serde(deserialize_with = "quantity")]
    pub log_index: u64,
}

impl ReceiptLog {
    /// First topic, if any.
    #[must_use]
    pub fn signature(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Read access to the chain.
///
/// Every call may fail transiently; callers decide on retries.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head height.
    async fn chain_height(&self) -> IndexerResult<u64>;

    /// Block at `height` with full transactions, `None` if not yet available.
    async fn block_with_transactions(&self, height: u64) -> IndexerResult<Option<ChainBlock>>;

    /// Hash of the canonical block at `height`.
    async fn block_hash(&self, height: u64) -> IndexerResult<Option<B256>>;

    /// Receipt of `hash`, `None` if the node does not know it (yet).
    async fn transaction_receipt(&self, hash: B256) -> IndexerResult<Option<TxReceipt>>;

    /// Owners of the Gnosis Safe at `safe`.
    async fn safe_owners(&self, safe: Address) -> IndexerResult<Vec<Address>>;
}

/// Creates chain clients; the round controller asks for a fresh one per round.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Open a new client.
    async fn connect(&self) -> IndexerResult<Arc<dyn ChainClient>>;
}
