//! Detail records produced by extraction.

use alloy::primitives::{Address, B256, U256};
use serde::Serialize;

/// Back-reference from a detail to its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxRef {
    /// Transaction hash
    pub hash: B256,
    /// Position within the block
    pub index: u64,
    /// Block timestamp
    pub timestamp: u64,
    /// Block height
    pub block_number: u64,
}

/// Destination table of a detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailKind {
    /// `crc_trust`
    CrcTrust,
    /// `crc_signup`
    CrcSignup,
    /// `crc_organisation_signup`
    CrcOrganisationSignup,
    /// `crc_hub_transfer`
    CrcHubTransfer,
    /// `erc20_transfer`
    Erc20Transfer,
    /// `eth_transfer`
    EthTransfer,
    /// `gnosis_safe_eth_transfer`
    GnosisSafeEthTransfer,
}

impl DetailKind {
    /// Every kind, in import order.
    pub const ALL: [Self; 7] = [
        Self::CrcTrust,
        Self::CrcSignup,
        Self::CrcOrganisationSignup,
        Self::CrcHubTransfer,
        Self::Erc20Transfer,
        Self::EthTransfer,
        Self::GnosisSafeEthTransfer,
    ];

    /// Permanent table name.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::CrcTrust => "crc_trust",
            Self::CrcSignup => "crc_signup",
            Self::CrcOrganisationSignup => "crc_organisation_signup",
            Self::CrcHubTransfer => "crc_hub_transfer",
            Self::Erc20Transfer => "erc20_transfer",
            Self::EthTransfer => "eth_transfer",
            Self::GnosisSafeEthTransfer => "gnosis_safe_eth_transfer",
        }
    }
}

/// One extracted domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum TransactionDetail {
    /// Trust change
    CrcTrust {
        /// Owning transaction
        tx: TxRef,
        /// Log position
        log_index: u64,
        /// Account accepting tokens
        user: Address,
        /// Account whose tokens are accepted
        can_send_to: Address,
        /// Percent, 0 revokes
        limit: u64,
    },
    /// Person signup
    CrcSignup {
        /// Owning transaction
        tx: TxRef,
        /// Log position
        log_index: u64,
        /// The new user's Safe
        user: Address,
        /// Personal token
        token: Address,
        /// Safe owners, empty if the lookup failed
        owners: Vec<Address>,
    },
    /// Organisation signup
    CrcOrganisationSignup {
        /// Owning transaction
        tx: TxRef,
        /// Log position
        log_index: u64,
        /// The organisation's Safe
        organisation: Address,
        /// Safe owners, empty if the lookup failed
        owners: Vec<Address>,
    },
    /// Transitive hub transfer
    CrcHubTransfer {
        /// Owning transaction
        tx: TxRef,
        /// Log position
        log_index: u64,
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Amount
        value: U256,
    },
    /// ERC20 token movement
    Erc20Transfer {
        /// Owning transaction
        tx: TxRef,
        /// Log position
        log_index: u64,
        /// Token contract
        token: Address,
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Amount
        value: U256,
    },
    /// Plain ETH transfer
    EthTransfer {
        /// Owning transaction
        tx: TxRef,
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Wei
        value: U256,
    },
    /// ETH paid out by a Safe
    GnosisSafeEthTransfer {
        /// Owning transaction
        tx: TxRef,
        /// Account that submitted the Safe transaction
        initiator: Address,
        /// The Safe
        from: Address,
        /// Recipient
        to: Address,
        /// Wei
        value: U256,
    },
}

impl TransactionDetail {
    /// Destination table kind.
    #[must_use]
    pub const fn kind(&self) -> DetailKind {
        match self {
            Self::CrcTrust { .. } => DetailKind::CrcTrust,
            Self::CrcSignup { .. } => DetailKind::CrcSignup,
            Self::CrcOrganisationSignup { .. } => DetailKind::CrcOrganisationSignup,
            Self::CrcHubTransfer { .. } => DetailKind::CrcHubTransfer,
            Self::Erc20Transfer { .. } => DetailKind::Erc20Transfer,
            Self::EthTransfer { .. } => DetailKind::EthTransfer,
            Self::GnosisSafeEthTransfer { .. } => DetailKind::GnosisSafeEthTransfer,
        }
    }

    /// Owning transaction.
    #[must_use]
    pub const fn tx(&self) -> &TxRef {
        match self {
            Self::CrcTrust { tx, .. }
            | Self::CrcSignup { tx, .. }
            | Self::CrcOrganisationSignup { tx, .. }
            | Self::CrcHubTransfer { tx, .. }
            | Self::Erc20Transfer { tx, .. }
            | Self::EthTransfer { tx, .. }
            | Self::GnosisSafeEthTransfer { tx, .. } => tx,
        }
    }

    /// Log position; transaction-level details use 0.
    #[must_use]
    pub const fn log_index(&self) -> u64 {
        match self {
            Self::CrcTrust { log_index, .. }
            | Self::CrcSignup { log_index, .. }
            | Self::CrcOrganisationSignup { log_index, .. }
            | Self::CrcHubTransfer { log_index, .. }
            | Self::Erc20Transfer { log_index, .. } => *log_index,
            Self::EthTransfer { .. } | Self::GnosisSafeEthTransfer { .. } => 0,
        }
    }
}
