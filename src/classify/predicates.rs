//! Structural predicates over transactions, receipts and logs.
//!
//! Each predicate returns `Ok(Some(fields))` when its shape matches,
//! `Ok(None)` when it does not, and `Err` only when the shape matched but the
//! payload could not be decoded.

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};

use crate::chain::{ChainTransaction, ReceiptLog, TxReceipt};
use crate::error::{IndexerError, IndexerResult};
use crate::events::{
    data_uint, data_word, topic_address, ICirclesHub, IErc20, IGnosisSafe, MAX_TRUST_LIMIT,
    SIGNUP_MINT_AMOUNT,
};

/// Fields of an ERC20 `Transfer` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Erc20TransferLog {
    /// Token contract (log address)
    pub token: Address,
    /// Sender, zero address for mints
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Amount in token base units
    pub value: U256,
    /// Position of the log within the block
    pub log_index: u64,
}

/// Fields of a hub `Trust` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustLog {
    /// Account accepting tokens
    pub user: Address,
    /// Account whose tokens are accepted
    pub can_send_to: Address,
    /// Trust limit in percent, 0 revokes
    pub limit: u64,
    /// Position of the log within the block
    pub log_index: u64,
}

/// Fields of a hub `HubTransfer` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubTransferLog {
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Amount routed through the trust graph
    pub amount: U256,
    /// Position of the log within the block
    pub log_index: u64,
}

/// Fields of a complete person signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignupLog {
    /// The new user (their Safe)
    pub user: Address,
    /// The user's personal token
    pub token: Address,
    /// Position of the `Signup` log within the block
    pub log_index: u64,
}

/// Fields of a hub `OrganizationSignup` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrganisationSignupLog {
    /// The new organisation
    pub organisation: Address,
    /// Position of the log within the block
    pub log_index: u64,
}

/// A plain ETH transfer executed through a Gnosis Safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeEthTransferCall {
    /// Externally owned account that submitted the transaction
    pub initiator: Address,
    /// The Safe paying out
    pub from: Address,
    /// Recipient of the ETH
    pub to: Address,
    /// Wei transferred
    pub value: U256,
}

fn topic_matches(log: &ReceiptLog, topic: B256, topics: usize) -> bool {
    log.topics.len() == topics && log.signature() == Some(&topic)
}

/// ERC20 `Transfer`: exactly three topics, value in the first data word.
///
/// ERC721 transfers carry four topics and are rejected here.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if the data holds no value word.
pub fn is_erc20_transfer(log: &ReceiptLog) -> IndexerResult<Option<Erc20TransferLog>> {
    if !topic_matches(log, IErc20::Transfer::SIGNATURE_HASH, 3) {
        return Ok(None);
    }
    Ok(Some(Erc20TransferLog {
        token: log.address,
        from: topic_address(&log.topics[1]),
        to: topic_address(&log.topics[2]),
        value: data_uint(&log.data, 0)?,
        log_index: log.log_index,
    }))
}

/// Hub `Trust` with a limit in `[0, 100]`.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if the data holds no limit word.
pub fn is_crc_trust(log: &ReceiptLog, hub: Address) -> IndexerResult<Option<TrustLog>> {
    if log.address != hub || !topic_matches(log, ICirclesHub::Trust::SIGNATURE_HASH, 3) {
        return Ok(None);
    }
    let limit = data_uint(&log.data, 0)?;
    if limit > U256::from(MAX_TRUST_LIMIT) {
        return Ok(None);
    }
    Ok(Some(TrustLog {
        can_send_to: topic_address(&log.topics[1]),
        user: topic_address(&log.topics[2]),
        limit: limit.to::<u64>(),
        log_index: log.log_index,
    }))
}

/// Hub `OrganizationSignup` with two topics.
#[must_use]
pub fn is_crc_organisation_signup(log: &ReceiptLog, hub: Address) -> Option<OrganisationSignupLog> {
    if log.address != hub
        || !topic_matches(log, ICirclesHub::OrganizationSignup::SIGNATURE_HASH, 2)
    {
        return None;
    }
    Some(OrganisationSignupLog {
        organisation: topic_address(&log.topics[1]),
        log_index: log.log_index,
    })
}

fn has_erc20_transfer(receipt: &TxReceipt) -> bool {
    receipt
        .logs
        .iter()
        .any(|log| matches!(is_erc20_transfer(log), Ok(Some(_))))
}

/// Exactly one hub `HubTransfer` log, accompanied by at least one ERC20
/// transfer in the same receipt.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if the data holds no amount word.
pub fn is_crc_hub_transfer(
    receipt: &TxReceipt,
    hub: Address,
) -> IndexerResult<Option<HubTransferLog>> {
    let mut matching = receipt.logs.iter().filter(|log| {
        log.address == hub && topic_matches(log, ICirclesHub::HubTransfer::SIGNATURE_HASH, 3)
    });
    let (Some(log), None) = (matching.next(), matching.next()) else {
        return Ok(None);
    };
    if !has_erc20_transfer(receipt) {
        return Ok(None);
    }
    Ok(Some(HubTransferLog {
        from: topic_address(&log.topics[1]),
        to: topic_address(&log.topics[2]),
        amount: data_uint(&log.data, 0)?,
        log_index: log.log_index,
    }))
}

/// A complete person signup: the hub `Signup` log, the self-trust the hub
/// records for the new user and the initial 50 CRC mint to the user.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if the `Signup` data holds no
/// token word.
pub fn is_crc_signup(receipt: &TxReceipt, hub: Address) -> IndexerResult<Option<SignupLog>> {
    if receipt.logs.len() < 3 {
        return Ok(None);
    }
    let Some(signup) = receipt.logs.iter().find(|log| {
        log.address == hub && topic_matches(log, ICirclesHub::Signup::SIGNATURE_HASH, 2)
    }) else {
        return Ok(None);
    };

    let user = topic_address(&signup.topics[1]);
    let token = Address::from_word(data_word(&signup.data, 0)?);

    let self_trust = receipt.logs.iter().any(|log| {
        matches!(
            is_crc_trust(log, hub),
            Ok(Some(trust)) if trust.can_send_to == user && trust.user == user
        )
    });
    let minted = receipt.logs.iter().any(|log| {
        matches!(
            is_erc20_transfer(log),
            Ok(Some(transfer))
                if transfer.from == Address::ZERO
                    && transfer.to == user
                    && transfer.value == SIGNUP_MINT_AMOUNT
        )
    });

    if !(self_trust && minted) {
        return Ok(None);
    }
    Ok(Some(SignupLog {
        user,
        token,
        log_index: signup.log_index,
    }))
}

/// Plain ETH transfer between externally owned accounts.
#[must_use]
pub fn is_eoa_eth_transfer(tx: &ChainTransaction, receipt: &TxReceipt) -> bool {
    tx.to.is_some() && !tx.value.is_zero() && tx.input.is_empty() && receipt.logs.is_empty()
}

/// `execTransaction` on a Safe moving ETH without a call (`operation == 0`,
/// empty inner data), confirmed by an `ExecutionSuccess` log.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if the input carries the
/// `execTransaction` selector but does not ABI-decode.
pub fn is_safe_eth_transfer(
    tx: &ChainTransaction,
    receipt: &TxReceipt,
) -> IndexerResult<Option<SafeEthTransferCall>> {
    if !tx.input.starts_with(&IGnosisSafe::execTransactionCall::SELECTOR) {
        return Ok(None);
    }
    let Some(safe) = tx.to else {
        return Ok(None);
    };
    let call = IGnosisSafe::execTransactionCall::abi_decode(&tx.input, true).map_err(|e| {
        IndexerError::decoding(
            format!("execTransaction input of {} does not decode", tx.hash),
            Some(Box::new(e)),
        )
    })?;

    if !call.data.is_empty() || call.operation != 0 {
        return Ok(None);
    }
    let succeeded = receipt
        .logs
        .iter()
        .any(|log| log.signature() == Some(&IGnosisSafe::ExecutionSuccess::SIGNATURE_HASH));
    if !succeeded {
        return Ok(None);
    }

    Ok(Some(SafeEthTransferCall {
        initiator: tx.from,
        from: safe,
        to: call.to,
        value: call.value,
    }))
}
