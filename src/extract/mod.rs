//! Detail extraction.
//!
//! For every class set on a transaction the matching `extract_*` function
//! re-runs that class's predicate and turns the decoded fields into
//! [`TransactionDetail`] rows. Nothing from classification is reused besides
//! the set of classes, so a detail can never disagree with its source data.
//!
//! Calling an extractor on a transaction that does not satisfy its predicate
//! is a caller bug and yields [`IndexerError::ExtractionError`].

mod details;

use alloy::primitives::Address;
use tracing::{debug, warn};

pub use details::{DetailKind, TransactionDetail, TxRef};

use crate::chain::{ChainClient, ChainTransaction, TxReceipt};
use crate::classify::predicates::{
    is_crc_hub_transfer, is_crc_organisation_signup, is_crc_signup, is_crc_trust,
    is_eoa_eth_transfer, is_erc20_transfer, is_safe_eth_transfer,
};
use crate::classify::{ClassificationSet, TransactionClass};
use crate::error::{IndexerError, IndexerResult};

impl TxRef {
    /// Reference to `tx` mined at `timestamp`.
    #[must_use]
    pub const fn of(tx: &ChainTransaction, timestamp: u64) -> Self {
        Self {
            hash: tx.hash,
            index: tx.transaction_index,
            timestamp,
            block_number: tx.block_number,
        }
    }
}

fn missing(class: TransactionClass, tx: &TxRef) -> IndexerError {
    IndexerError::extraction(format!(
        "transaction {} in block {} is not a {class}",
        tx.hash, tx.block_number
    ))
}

fn require_receipt<'a>(
    class: TransactionClass,
    tx: &TxRef,
    receipt: Option<&'a TxReceipt>,
) -> IndexerResult<&'a TxReceipt> {
    receipt.ok_or_else(|| {
        IndexerError::extraction(format!("{class} extraction for {} needs a receipt", tx.hash))
    })
}

/// Every trust log of the receipt. Malformed logs are skipped.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if the receipt holds no valid trust log.
pub fn extract_crc_trust(
    tx: &TxRef,
    receipt: &TxReceipt,
    hub: Address,
) -> IndexerResult<Vec<TransactionDetail>> {
    let mut details = Vec::new();
    for log in &receipt.logs {
        if let Ok(Some(trust)) = is_crc_trust(log, hub) {
            details.push(TransactionDetail::CrcTrust {
                tx: *tx,
                log_index: trust.log_index,
                user: trust.user,
                can_send_to: trust.can_send_to,
                limit: trust.limit,
            });
        }
    }
    if details.is_empty() {
        return Err(missing(TransactionClass::CrcTrust, tx));
    }
    Ok(details)
}

/// Every ERC20 transfer log of the receipt. Malformed logs are skipped.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if the receipt holds no transfer log.
pub fn extract_erc20_transfers(
    tx: &TxRef,
    receipt: &TxReceipt,
) -> IndexerResult<Vec<TransactionDetail>> {
    let mut details = Vec::new();
    for log in &receipt.logs {
        if let Ok(Some(transfer)) = is_erc20_transfer(log) {
            details.push(TransactionDetail::Erc20Transfer {
                tx: *tx,
                log_index: transfer.log_index,
                token: transfer.token,
                from: transfer.from,
                to: transfer.to,
                value: transfer.value,
            });
        }
    }
    if details.is_empty() {
        return Err(missing(TransactionClass::Erc20Transfer, tx));
    }
    Ok(details)
}

/// The hub transfer of the receipt.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if the receipt is not a hub transfer.
pub fn extract_crc_hub_transfer(
    tx: &TxRef,
    receipt: &TxReceipt,
    hub: Address,
) -> IndexerResult<TransactionDetail> {
    let transfer = is_crc_hub_transfer(receipt, hub)?
        .ok_or_else(|| missing(TransactionClass::CrcHubTransfer, tx))?;
    Ok(TransactionDetail::CrcHubTransfer {
        tx: *tx,
        log_index: transfer.log_index,
        from: transfer.from,
        to: transfer.to,
        value: transfer.amount,
    })
}

/// Owners of `safe`, empty when the call fails or returns nothing.
async fn owners_or_empty(client: &dyn ChainClient, safe: Address) -> Vec<Address> {
    match client.safe_owners(safe).await {
        Ok(owners) => owners,
        Err(e) => {
            warn!(safe = %safe, error = %e, "getOwners failed, storing no owners");
            Vec::new()
        }
    }
}

/// The signup of the receipt, with the owners of the new user's Safe.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if the receipt is not a complete signup.
pub async fn extract_crc_signup(
    tx: &TxRef,
    receipt: &TxReceipt,
    hub: Address,
    client: &dyn ChainClient,
) -> IndexerResult<TransactionDetail> {
    let signup =
        is_crc_signup(receipt, hub)?.ok_or_else(|| missing(TransactionClass::CrcSignup, tx))?;
    let owners = owners_or_empty(client, signup.user).await;
    Ok(TransactionDetail::CrcSignup {
        tx: *tx,
        log_index: signup.log_index,
        user: signup.user,
        token: signup.token,
        owners,
    })
}

/// Every organisation signup of the receipt, with Safe owners.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if the receipt holds no organisation
/// signup.
pub async fn extract_crc_organisation_signup(
    tx: &TxRef,
    receipt: &TxReceipt,
    hub: Address,
    client: &dyn ChainClient,
) -> IndexerResult<Vec<TransactionDetail>> {
    let mut details = Vec::new();
    for signup in receipt
        .logs
        .iter()
        .filter_map(|log| is_crc_organisation_signup(log, hub))
    {
        let owners = owners_or_empty(client, signup.organisation).await;
        details.push(TransactionDetail::CrcOrganisationSignup {
            tx: *tx,
            log_index: signup.log_index,
            organisation: signup.organisation,
            owners,
        });
    }
    if details.is_empty() {
        return Err(missing(TransactionClass::CrcOrganisationSignup, tx));
    }
    Ok(details)
}

/// A plain ETH transfer.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if `transaction` is not one.
pub fn extract_eth_transfer(
    tx: &TxRef,
    transaction: &ChainTransaction,
    receipt: &TxReceipt,
) -> IndexerResult<TransactionDetail> {
    match transaction.to {
        Some(to) if is_eoa_eth_transfer(transaction, receipt) => Ok(TransactionDetail::EthTransfer {
            tx: *tx,
            from: transaction.from,
            to,
            value: transaction.value,
        }),
        _ => Err(missing(TransactionClass::EoaEthTransfer, tx)),
    }
}

/// An ETH payout executed by a Safe.
///
/// # Errors
///
/// [`IndexerError::ExtractionError`] if `transaction` is not one.
pub fn extract_gnosis_safe_eth_transfer(
    tx: &TxRef,
    transaction: &ChainTransaction,
    receipt: &TxReceipt,
) -> IndexerResult<TransactionDetail> {
    let call = is_safe_eth_transfer(transaction, receipt)?
        .ok_or_else(|| missing(TransactionClass::SafeEthTransfer, tx))?;
    Ok(TransactionDetail::GnosisSafeEthTransfer {
        tx: *tx,
        initiator: call.initiator,
        from: call.from,
        to: call.to,
        value: call.value,
    })
}

/// Dispatches the per-class extractors.
#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    hub: Address,
}

impl Extractor {
    /// Extractor for the hub at `hub`.
    #[must_use]
    pub const fn new(hub: Address) -> Self {
        Self { hub }
    }

    /// All details of `transaction` for the classes in `classification`.
    ///
    /// `ContractCreation` and `Unknown` produce no details.
    ///
    /// # Errors
    ///
    /// [`IndexerError::ExtractionError`] if a class is set that the data does
    /// not support, [`IndexerError::DecodingError`] on malformed payloads.
    pub async fn extract(
        &self,
        classification: ClassificationSet,
        transaction: &ChainTransaction,
        timestamp: u64,
        receipt: Option<&TxReceipt>,
        client: &dyn ChainClient,
    ) -> IndexerResult<Vec<TransactionDetail>> {
        let tx = TxRef::of(transaction, timestamp);
        let mut details = Vec::new();

        for class in classification.iter() {
            match class {
                TransactionClass::Erc20Transfer => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.extend(extract_erc20_transfers(&tx, receipt)?);
                }
                TransactionClass::CrcTrust => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.extend(extract_crc_trust(&tx, receipt, self.hub)?);
                }
                TransactionClass::CrcHubTransfer => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.push(extract_crc_hub_transfer(&tx, receipt, self.hub)?);
                }
                TransactionClass::CrcSignup => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.push(extract_crc_signup(&tx, receipt, self.hub, client).await?);
                }
                TransactionClass::CrcOrganisationSignup => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.extend(
                        extract_crc_organisation_signup(&tx, receipt, self.hub, client).await?,
                    );
                }
                TransactionClass::EoaEthTransfer => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.push(extract_eth_transfer(&tx, transaction, receipt)?);
                }
                TransactionClass::SafeEthTransfer => {
                    let receipt = require_receipt(class, &tx, receipt)?;
                    details.push(extract_gnosis_safe_eth_transfer(&tx, transaction, receipt)?);
                }
                TransactionClass::ContractCreation | TransactionClass::Unknown => {}
            }
        }

        debug!(tx = %tx.hash, details = details.len(), "Extracted details");
        Ok(details)
    }
}
