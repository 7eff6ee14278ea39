//! Shared fixtures for the integration tests: an in-memory chain and
//! builders for blocks, transactions and Circles logs.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;

use circles_indexer::chain::{
    ChainBlock, ChainClient, ChainConnector, ChainTransaction, ReceiptLog, TxReceipt,
};
use circles_indexer::config::{Config, DEFAULT_HUB_ADDRESS};
use circles_indexer::error::{IndexerError, IndexerResult};
use circles_indexer::events::{ICirclesHub, IErc20, IGnosisSafe};

pub const HUB: Address = DEFAULT_HUB_ADDRESS;

/// Deterministic address from a small integer.
pub fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}

/// Deterministic block hash; `fork` distinguishes competing branches.
pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [0_u8; 32];
    bytes[0] = 0xb1;
    bytes[1] = fork;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

/// Deterministic transaction hash.
pub fn tx_hash(block: u64, index: u64) -> B256 {
    let mut bytes = [0_u8; 32];
    bytes[0] = 0x7a;
    bytes[8..16].copy_from_slice(&block.to_be_bytes());
    bytes[24..].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

pub fn wei(ether: u64) -> U256 {
    U256::from(ether) * U256::from(10_u64).pow(U256::from(18_u64))
}

pub fn transaction(
    block: u64,
    index: u64,
    from: Address,
    to: Option<Address>,
    value: U256,
    input: Bytes,
) -> ChainTransaction {
    ChainTransaction {
        hash: tx_hash(block, index),
        block_number: block,
        transaction_index: index,
        from,
        to,
        value,
        input,
        nonce: index,
        tx_type: Some(2),
    }
}

/// A plain ETH transfer between two accounts.
pub fn eth_transfer(
    block: u64,
    index: u64,
    from: Address,
    to: Address,
    value: U256,
) -> ChainTransaction {
    transaction(block, index, from, Some(to), value, Bytes::new())
}

/// A contract call with opaque call data.
pub fn contract_call(block: u64, index: u64, from: Address, to: Address) -> ChainTransaction {
    let input = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
    transaction(block, index, from, Some(to), U256::ZERO, input)
}

/// `execTransaction` on `safe` paying `value` to `to`.
pub fn safe_exec(
    block: u64,
    index: u64,
    initiator: Address,
    safe: Address,
    to: Address,
    value: U256,
    data: Bytes,
    operation: u8,
) -> ChainTransaction {
    let call = IGnosisSafe::execTransactionCall {
        to,
        value,
        data,
        operation,
        safeTxGas: U256::ZERO,
        baseGas: U256::ZERO,
        gasPrice: U256::ZERO,
        gasToken: Address::ZERO,
        refundReceiver: Address::ZERO,
        signatures: Bytes::from_static(&[1; 65]),
    };
    transaction(block, index, initiator, Some(safe), U256::ZERO, call.abi_encode().into())
}

pub fn block(number: u64, fork: u8, transactions: Vec<ChainTransaction>) -> ChainBlock {
    ChainBlock {
        number,
        hash: block_hash(number, fork),
        timestamp: 1_600_000_000 + number * 5,
        transactions,
    }
}

pub fn receipt(tx: &ChainTransaction, logs: Vec<ReceiptLog>) -> TxReceipt {
    TxReceipt {
        transaction_hash: tx.hash,
        status: Some(1),
        contract_address: None,
        logs,
    }
}

fn word(value: U256) -> Bytes {
    Bytes::from(value.to_be_bytes::<32>().to_vec())
}

pub fn raw_log(address: Address, topics: Vec<B256>, data: Bytes, log_index: u64) -> ReceiptLog {
    ReceiptLog {
        address,
        topics,
        data,
        log_index,
    }
}

pub fn erc20_transfer_log(
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    log_index: u64,
) -> ReceiptLog {
    raw_log(
        token,
        vec![IErc20::Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
        word(value),
        log_index,
    )
}

/// `user` trusts `can_send_to` with `limit` percent.
pub fn trust_log(can_send_to: Address, user: Address, limit: u64, log_index: u64) -> ReceiptLog {
    raw_log(
        HUB,
        vec![ICirclesHub::Trust::SIGNATURE_HASH, can_send_to.into_word(), user.into_word()],
        word(U256::from(limit)),
        log_index,
    )
}

pub fn signup_log(user: Address, token: Address, log_index: u64) -> ReceiptLog {
    raw_log(
        HUB,
        vec![ICirclesHub::Signup::SIGNATURE_HASH, user.into_word()],
        Bytes::from(token.into_word().to_vec()),
        log_index,
    )
}

pub fn organisation_signup_log(organisation: Address, log_index: u64) -> ReceiptLog {
    raw_log(
        HUB,
        vec![ICirclesHub::OrganizationSignup::SIGNATURE_HASH, organisation.into_word()],
        Bytes::new(),
        log_index,
    )
}

pub fn hub_transfer_log(from: Address, to: Address, amount: U256, log_index: u64) -> ReceiptLog {
    raw_log(
        HUB,
        vec![ICirclesHub::HubTransfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
        word(amount),
        log_index,
    )
}

pub fn execution_success_log(safe: Address, log_index: u64) -> ReceiptLog {
    let mut data = vec![0_u8; 64];
    data[0] = 0x11;
    raw_log(
        safe,
        vec![IGnosisSafe::ExecutionSuccess::SIGNATURE_HASH],
        Bytes::from(data),
        log_index,
    )
}

/// The three logs of a complete person signup.
pub fn signup_logs(user: Address, token: Address, mint: U256) -> Vec<ReceiptLog> {
    vec![
        trust_log(user, user, 100, 0),
        erc20_transfer_log(token, Address::ZERO, user, mint, 1),
        signup_log(user, token, 2),
    ]
}

#[derive(Default)]
struct ChainData {
    blocks: BTreeMap<u64, ChainBlock>,
    receipts: HashMap<B256, TxReceipt>,
    owners: HashMap<Address, Vec<Address>>,
    unavailable_receipts: HashSet<B256>,
    head_override: Option<u64>,
}

/// In-memory chain serving blocks and receipts from maps.
#[derive(Default)]
pub struct MockChain {
    data: Mutex<ChainData>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add (or replace) a block.
    pub fn put_block(&self, block: ChainBlock) {
        self.data.lock().expect("lock").blocks.insert(block.number, block);
    }

    /// Add empty blocks for every height in `range`.
    pub fn put_empty_blocks(&self, range: std::ops::RangeInclusive<u64>, fork: u8) {
        for number in range {
            self.put_block(block(number, fork, Vec::new()));
        }
    }

    pub fn put_receipt(&self, receipt: TxReceipt) {
        self.data
            .lock()
            .expect("lock")
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn set_owners(&self, safe: Address, owners: Vec<Address>) {
        self.data.lock().expect("lock").owners.insert(safe, owners);
    }

    /// Make the receipt of `hash` fail with a transient RPC error.
    pub fn fail_receipt(&self, hash: B256) {
        self.data.lock().expect("lock").unavailable_receipts.insert(hash);
    }

    /// Report `head` as chain height instead of the highest stored block.
    pub fn set_head(&self, head: u64) {
        self.data.lock().expect("lock").head_override = Some(head);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_height(&self) -> IndexerResult<u64> {
        let data = self.data.lock().expect("lock");
        Ok(data
            .head_override
            .or_else(|| data.blocks.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn block_with_transactions(&self, height: u64) -> IndexerResult<Option<ChainBlock>> {
        Ok(self.data.lock().expect("lock").blocks.get(&height).cloned())
    }

    async fn block_hash(&self, height: u64) -> IndexerResult<Option<B256>> {
        Ok(self
            .data
            .lock()
            .expect("lock")
            .blocks
            .get(&height)
            .map(|b| b.hash))
    }

    async fn transaction_receipt(&self, hash: B256) -> IndexerResult<Option<TxReceipt>> {
        let data = self.data.lock().expect("lock");
        if data.unavailable_receipts.contains(&hash) {
            return Err(IndexerError::rpc(format!("receipt {hash} unavailable"), None));
        }
        Ok(data.receipts.get(&hash).cloned())
    }

    async fn safe_owners(&self, safe: Address) -> IndexerResult<Vec<Address>> {
        self.data
            .lock()
            .expect("lock")
            .owners
            .get(&safe)
            .cloned()
            .ok_or_else(|| IndexerError::rpc(format!("{safe} is not a Safe"), None))
    }
}

/// Hands out the same [`MockChain`] on every connect.
pub struct MockConnector(pub Arc<MockChain>);

#[async_trait]
impl ChainConnector for MockConnector {
    async fn connect(&self) -> IndexerResult<Arc<dyn ChainClient>> {
        Ok(Arc::clone(&self.0) as Arc<dyn ChainClient>)
    }
}

/// Configuration for tests: in-memory store, small batches, no penalties.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut values: HashMap<String, String> = [
        ("CONNECTION_STRING", "sqlite::memory:"),
        ("RPC_URL", "http://localhost:8545"),
        ("BULK_THRESHOLD", "2"),
        ("WRITE_TO_STAGING_BATCH_SIZE", "4"),
        ("FLUSH_EVERY_NTH_BATCH_BULK", "2"),
        ("ERROR_BASE_PENALTY_MS", "0"),
        ("RPC_FETCH_RETRIES", "2"),
        ("LIVE_POLL_INTERVAL_MS", "20"),
    ]
    .iter()
    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
    .collect();
    for (k, v) in overrides {
        values.insert((*k).to_string(), (*v).to_string());
    }
    Config::from_lookup(move |key| values.get(key).cloned()).expect("valid test config")
}

/// Poll `condition` until it holds, failing the test after 20 seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
