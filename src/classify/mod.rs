//! Transaction classification.
//!
//! [`Classifier::classify`] maps a transaction and its receipt to the set of
//! [`TransactionClass`]es it belongs to. It is pure: no I/O, no state beyond
//! the hub address. A transaction may carry several classes at once, e.g. a
//! signup always also contains an ERC20 mint.
//!
//! Malformed payloads never fail classification. The affected class is left
//! out and the decoding error is logged.

pub mod predicates;

use std::fmt;
use std::str::FromStr;

use alloy::primitives::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::chain::{ChainTransaction, TxReceipt};
use crate::error::{IndexerError, IndexerResult};

pub use predicates::{
    is_crc_hub_transfer, is_crc_organisation_signup, is_crc_signup, is_crc_trust,
    is_eoa_eth_transfer, is_erc20_transfer, is_safe_eth_transfer,
};

/// The fixed taxonomy of transaction classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionClass {
    /// At least one ERC20 `Transfer` log
    Erc20Transfer,
    /// Person signup at the hub
    CrcSignup,
    /// Organisation signup at the hub
    CrcOrganisationSignup,
    /// Transitive transfer through the hub
    CrcHubTransfer,
    /// Trust change at the hub
    CrcTrust,
    /// Plain ETH transfer
    EoaEthTransfer,
    /// ETH transfer executed by a Gnosis Safe
    SafeEthTransfer,
    /// Contract deployment
    ContractCreation,
    /// Nothing else matched, or the receipt is missing
    Unknown,
}

impl TransactionClass {
    /// Every class, in bit order.
    pub const ALL: [Self; 9] = [
        Self::Erc20Transfer,
        Self::CrcSignup,
        Self::CrcOrganisationSignup,
        Self::CrcHubTransfer,
        Self::CrcTrust,
        Self::EoaEthTransfer,
        Self::SafeEthTransfer,
        Self::ContractCreation,
        Self::Unknown,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Stable name used in storage.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Erc20Transfer => "Erc20Transfer",
            Self::CrcSignup => "CrcSignup",
            Self::CrcOrganisationSignup => "CrcOrganisationSignup",
            Self::CrcHubTransfer => "CrcHubTransfer",
            Self::CrcTrust => "CrcTrust",
            Self::EoaEthTransfer => "EoaEthTransfer",
            Self::SafeEthTransfer => "SafeEthTransfer",
            Self::ContractCreation => "ContractCreation",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TransactionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransactionClass {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.name() == s)
            .ok_or_else(|| IndexerError::decoding(format!("unknown transaction class '{s}'"), None))
    }
}

/// Compact set of [`TransactionClass`]es.
///
/// Serialises as a list of class names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClassificationSet(u16);

impl ClassificationSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether `class` is set.
    #[must_use]
    pub const fn contains(self, class: TransactionClass) -> bool {
        self.0 & class.bit() != 0
    }

    /// Set `class`; returns true if it was not set before.
    pub fn insert(&mut self, class: TransactionClass) -> bool {
        let added = !self.contains(class);
        self.0 |= class.bit();
        added
    }

    /// Whether no class is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of classes set.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Set classes in bit order.
    pub fn iter(self) -> impl Iterator<Item = TransactionClass> {
        TransactionClass::ALL
            .into_iter()
            .filter(move |class| self.contains(*class))
    }

    /// Names of the set classes in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(TransactionClass::name).collect()
    }

    /// JSON list of names, as stored in `transaction_2.classification`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DecodingError`] if serialisation fails.
    pub fn to_json(self) -> IndexerResult<String> {
        serde_json::to_string(&self)
            .map_err(|e| IndexerError::decoding("classification to JSON", Some(Box::new(e))))
    }
}

impl FromIterator<TransactionClass> for ClassificationSet {
    fn from_iter<I: IntoIterator<Item = TransactionClass>>(iter: I) -> Self {
        let mut set = Self::empty();
        for class in iter {
            set.insert(class);
        }
        set
    }
}

impl Serialize for ClassificationSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for ClassificationSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<TransactionClass>::deserialize(deserializer)?
            .into_iter()
            .collect())
    }
}

/// Applies the predicates for one hub contract.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    hub: Address,
}

fn keep<T>(class: TransactionClass, tx: &ChainTransaction, result: IndexerResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                tx = %tx.hash,
                class = class.name(),
                error = %e,
                "Dropping class on malformed data"
            );
            None
        }
    }
}

impl Classifier {
    /// Classifier for the hub at `hub`.
    #[must_use]
    pub const fn new(hub: Address) -> Self {
        Self { hub }
    }

    /// The hub contract address.
    #[must_use]
    pub const fn hub(&self) -> Address {
        self.hub
    }

    /// Classify `tx`. A missing receipt yields `Unknown` (plus
    /// `ContractCreation` where that follows from the transaction alone).
    #[must_use]
    pub fn classify(
        &self,
        tx: &ChainTransaction,
        receipt: Option<&TxReceipt>,
    ) -> ClassificationSet {
        let mut set = ClassificationSet::empty();
        if tx.to.is_none() {
            set.insert(TransactionClass::ContractCreation);
        }

        let Some(receipt) = receipt else {
            set.insert(TransactionClass::Unknown);
            return set;
        };

        for log in &receipt.logs {
            let erc20 = keep(TransactionClass::Erc20Transfer, tx, is_erc20_transfer(log));
            if matches!(erc20, Some(Some(_))) {
                set.insert(TransactionClass::Erc20Transfer);
            }
            let trust = keep(TransactionClass::CrcTrust, tx, is_crc_trust(log, self.hub));
            if matches!(trust, Some(Some(_))) {
                set.insert(TransactionClass::CrcTrust);
            }
            if is_crc_organisation_signup(log, self.hub).is_some() {
                set.insert(TransactionClass::CrcOrganisationSignup);
            }
        }

        let hub_transfer = keep(
            TransactionClass::CrcHubTransfer,
            tx,
            is_crc_hub_transfer(receipt, self.hub),
        );
        if matches!(hub_transfer, Some(Some(_))) {
            set.insert(TransactionClass::CrcHubTransfer);
        }

        let signup = keep(TransactionClass::CrcSignup, tx, is_crc_signup(receipt, self.hub));
        if matches!(signup, Some(Some(_))) {
            set.insert(TransactionClass::CrcSignup);
        }

        if is_eoa_eth_transfer(tx, receipt) {
            set.insert(TransactionClass::EoaEthTransfer);
        }

        let safe = keep(
            TransactionClass::SafeEthTransfer,
            tx,
            is_safe_eth_transfer(tx, receipt),
        );
        if matches!(safe, Some(Some(_))) {
            set.insert(TransactionClass::SafeEthTransfer);
        }

        if set.is_empty() {
            set.insert(TransactionClass::Unknown);
        }
        set
    }
}
