//! Database models that map to SQL tables.
//!
//! Records are the read side (`sqlx::FromRow`), [`IndexedTransaction`] and
//! [`DetailRow`] are the write side produced by the pipeline. Hashes and
//! addresses are stored as lower-case `0x` hex, 256-bit amounts as decimal
//! text.

use alloy::primitives::{Address, B256};
use serde::Serialize;

use crate::chain::{ChainBlock, ChainTransaction};
use crate::classify::ClassificationSet;
use crate::error::{IndexerError, IndexerResult};
use crate::extract::{DetailKind, TransactionDetail};

/// Permanent tables, in import order.
pub const PERMANENT_TABLES: [&str; 9] = [
    "block",
    "transaction_2",
    "crc_trust",
    "crc_signup",
    "crc_organisation_signup",
    "crc_hub_transfer",
    "erc20_transfer",
    "eth_transfer",
    "gnosis_safe_eth_transfer",
];

/// Columns shared by every detail table, in storage order.
pub const DETAIL_KEY_COLUMNS: [&str; 5] =
    ["hash", "log_index", "block_number", "\"index\"", "timestamp"];

/// Columns of `transaction_2` and its staging twin.
pub const TRANSACTION_COLUMNS: [&str; 11] = [
    "hash",
    "block_number",
    "\"index\"",
    "timestamp",
    "\"from\"",
    "\"to\"",
    "value",
    "input",
    "nonce",
    "type",
    "classification",
];

/// Kind-specific columns following [`DETAIL_KEY_COLUMNS`].
#[must_use]
pub const fn detail_columns(kind: DetailKind) -> &'static [&'static str] {
    match kind {
        DetailKind::CrcTrust => &["\"user\"", "can_send_to", "\"limit\""],
        DetailKind::CrcSignup => &["\"user\"", "token", "owners"],
        DetailKind::CrcOrganisationSignup => &["organisation", "owners"],
        DetailKind::CrcHubTransfer | DetailKind::EthTransfer => &["\"from\"", "\"to\"", "value"],
        DetailKind::Erc20Transfer => &["token", "\"from\"", "\"to\"", "value"],
        DetailKind::GnosisSafeEthTransfer => &["initiator", "\"from\"", "\"to\"", "value"],
    }
}

/// Staging twin of a permanent table.
#[must_use]
pub fn staging_table(table: &str) -> String {
    format!("_staging_{table}")
}

/// Lower-case `0x` hex of an address.
#[must_use]
pub fn hex_address(address: &Address) -> String {
    format!("{address:#x}")
}

/// Lower-case `0x` hex of a hash.
#[must_use]
pub fn hex_hash(hash: &B256) -> String {
    format!("{hash:#x}")
}

/// SQLite stores integers as i64.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] for values above `i64::MAX`
/// instead of wrapping them.
pub fn sql_int(value: u64) -> IndexerResult<i64> {
    i64::try_from(value).map_err(|e| {
        IndexerError::database(
            format!("{value} does not fit an SQLite integer"),
            Some(Box::new(e)),
        )
    })
}

/// Inverse of [`sql_int`].
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn from_sql_int(value: i64) -> u64 {
    value as u64
}

/// Block fields carried alongside every transaction of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Height
    pub number: u64,
    /// Hash
    pub hash: B256,
    /// Unix timestamp
    pub timestamp: u64,
    /// Number of transactions in the block
    pub transaction_count: u64,
}

impl From<&ChainBlock> for BlockHeader {
    fn from(block: &ChainBlock) -> Self {
        Self {
            number: block.number,
            hash: block.hash,
            timestamp: block.timestamp,
            transaction_count: block.transactions.len() as u64,
        }
    }
}

/// A classified transaction with its details, ready for staging.
#[derive(Debug, Clone)]
pub struct IndexedTransaction {
    /// Including block
    pub block: BlockHeader,
    /// The transaction
    pub transaction: ChainTransaction,
    /// Classes it belongs to
    pub classification: ClassificationSet,
    /// Extracted details
    pub details: Vec<TransactionDetail>,
}

/// A typed SQL value for bulk inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// TEXT
    Text(String),
    /// INTEGER
    Int(i64),
    /// NULL
    Null,
}

/// A detail flattened into the column layout of its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRow {
    /// Destination table
    pub kind: DetailKind,
    /// Values for [`DETAIL_KEY_COLUMNS`] followed by [`detail_columns`]
    pub values: Vec<Column>,
}

fn owners_json(owners: &[Address]) -> String {
    let hex: Vec<String> = owners.iter().map(hex_address).collect();
    serde_json::to_string(&hex).unwrap_or_else(|_| "[]".to_string())
}

impl TryFrom<&TransactionDetail> for DetailRow {
    type Error = IndexerError;

    fn try_from(detail: &TransactionDetail) -> IndexerResult<Self> {
        let tx = detail.tx();
        let mut values = vec![
            Column::Text(hex_hash(&tx.hash)),
            Column::Int(sql_int(detail.log_index())?),
            Column::Int(sql_int(tx.block_number)?),
            Column::Int(sql_int(tx.index)?),
            Column::Int(sql_int(tx.timestamp)?),
        ];
        let text = |a: &Address| Column::Text(hex_address(a));

        match detail {
            TransactionDetail::CrcTrust {
                user,
                can_send_to,
                limit,
                ..
            } => values.extend([text(user), text(can_send_to), Column::Int(sql_int(*limit)?)]),
            TransactionDetail::CrcSignup {
                user, token, owners, ..
            } => values.extend([text(user), text(token), Column::Text(owners_json(owners))]),
            TransactionDetail::CrcOrganisationSignup {
                organisation,
                owners,
                ..
            } => values.extend([text(organisation), Column::Text(owners_json(owners))]),
            TransactionDetail::CrcHubTransfer {
                from, to, value, ..
            }
            | TransactionDetail::EthTransfer {
                from, to, value, ..
            } => values.extend([text(from), text(to), Column::Text(value.to_string())]),
            TransactionDetail::Erc20Transfer {
                token,
                from,
                to,
                value,
                ..
            } => values.extend([
                text(token),
                text(from),
                text(to),
                Column::Text(value.to_string()),
            ]),
            TransactionDetail::GnosisSafeEthTransfer {
                initiator,
                from,
                to,
                value,
                ..
            } => values.extend([
                text(initiator),
                text(from),
                text(to),
                Column::Text(value.to_string()),
            ]),
        }

        Ok(Self {
            kind: detail.kind(),
            values,
        })
    }
}

/// A row of the `block` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BlockRecord {
    /// Height
    pub number: i64,
    /// Hash (hex)
    pub hash: String,
    /// Unix timestamp
    pub timestamp: i64,
    /// Transactions in the block
    pub total_transaction_count: i64,
    /// Transactions stored for the block
    pub indexed_transaction_count: i64,
    /// Unix timestamp of promotion
    pub imported_at: i64,
}

/// A row of the `transaction_2` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TransactionRecord {
    /// Hash (hex)
    pub hash: String,
    /// Including block
    pub block_number: i64,
    /// Position in block
    pub index: i64,
    /// Block timestamp
    pub timestamp: i64,
    /// Sender (hex)
    pub from: String,
    /// Recipient (hex), `None` for contract creation
    pub to: Option<String>,
    /// Wei (decimal)
    pub value: String,
    /// Call data (hex)
    pub input: String,
    /// Sender nonce
    pub nonce: i64,
    /// Envelope type
    #[sqlx(rename = "type")]
    pub tx_type: Option<i64>,
    /// JSON list of class names
    pub classification: String,
}

/// Row count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    /// Table name
    pub table: String,
    /// Number of rows
    pub rows: i64,
}
