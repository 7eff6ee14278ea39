//! Contract bindings for the events and calls the indexer understands.
//!
//! Alloy's `sol!` macro generates the event signature hashes and the call
//! codecs from the Solidity declarations below, so topic constants and
//! function selectors never have to be hard-coded.
//!
//! ## Contracts
//!
//! - [`IErc20`]: the standard `Transfer` event, emitted by every Circles token
//! - [`ICirclesHub`]: trust, signup and hub-transfer events of the Circles hub
//! - [`IGnosisSafe`]: `execTransaction`, `ExecutionSuccess` and `getOwners` of
//!   the Gnosis Safe multisig used as Circles wallets
//!
//! Log fields are read directly from topics and data words with the helpers
//! at the bottom of this module; the classifier needs to tolerate logs that
//! share a topic but not a shape, which strict event decoding would reject
//! wholesale.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;

use crate::error::{IndexerError, IndexerResult};

sol! {
    /// Minimal ERC20 surface.
    interface IErc20 {
        /// Token movement, also used for minting (from = zero address).
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

sol! {
    /// Circles UBI hub.
    interface ICirclesHub {
        /// A person registered and received a personal token.
        event Signup(address indexed user, address token);

        /// An organisation registered.
        event OrganizationSignup(address indexed organization);

        /// `user` accepts tokens of `canSendTo` up to `limit` percent.
        event Trust(address indexed canSendTo, address indexed user, uint256 limit);

        /// Transitive transfer routed through the trust graph.
        event HubTransfer(address indexed from, address indexed to, uint256 amount);
    }
}

sol! {
    /// Gnosis Safe multisig wallet.
    #[sol(rpc)]
    interface IGnosisSafe {
        event ExecutionSuccess(bytes32 txHash, uint256 payment);

        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool success);

        function getOwners() external view returns (address[] memory);
    }
}

/// Amount of personal tokens minted to a new Circles user at signup (50 CRC).
pub const SIGNUP_MINT_AMOUNT: U256 = U256::from_limbs([13_106_511_852_580_896_768, 2, 0, 0]);

/// Highest trust limit the hub accepts, in percent.
pub const MAX_TRUST_LIMIT: u64 = 100;

/// Read the address stored in an indexed topic (last 20 of 32 bytes).
#[must_use]
pub fn topic_address(topic: &B256) -> Address {
    Address::from_word(*topic)
}

/// Read the `index`-th 32-byte word of non-indexed log data.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if `data` is too short.
pub fn data_word(data: &[u8], index: usize) -> IndexerResult<B256> {
    let start = index * 32;
    data.get(start..start + 32)
        .map(B256::from_slice)
        .ok_or_else(|| {
            IndexerError::decoding(
                format!(
                    "log data has {} bytes, word {index} needs {}",
                    data.len(),
                    start + 32
                ),
                None,
            )
        })
}

/// Read a `uint256` from the `index`-th data word.
///
/// # Errors
///
/// Returns [`IndexerError::DecodingError`] if `data` is too short.
pub fn data_uint(data: &[u8], index: usize) -> IndexerResult<U256> {
    data_word(data, index).map(|word| U256::from_be_bytes(word.0))
}
