//! Blockchain read capability consumed by the payment verifier.

use crate::error::Result;
use crate::payment::wallet::{EvmAddress, TxHash};
use async_trait::async_trait;
use std::time::Duration;

/// keccak256("Transfer(address,address,uint256)").
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// An ERC-20 `Transfer` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLog {
    /// Transaction that emitted the event.
    pub tx_hash: TxHash,
    /// Token contract that emitted the event.
    pub token: EvmAddress,
    /// Sender.
    pub from: EvmAddress,
    /// Recipient.
    pub to: EvmAddress,
    /// Amount in the token's smallest unit.
    pub value: u128,
    /// Block the transaction was included in.
    pub block_number: u64,
}

/// Log query for transfers between two addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFilter {
    /// Token contract; `None` matches any emitter.
    pub token: Option<EvmAddress>,
    /// Sender.
    pub from: EvmAddress,
    /// Recipient.
    pub to: EvmAddress,
    /// First block, inclusive.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
}

/// Inclusion receipt of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Transaction hash.
    pub tx_hash: TxHash,
    /// Inclusion block.
    pub block_number: u64,
    /// Whether execution succeeded.
    pub success: bool,
}

/// Read access to the chain carrying the payment asset.
///
/// Implementations report transport failures as `UpstreamUnavailable`;
/// retries are the caller's concern.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the node cannot be reached.
    async fn block_number(&self) -> Result<u64>;

    /// Transfer events matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the node cannot be reached.
    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<TransferLog>>;

    /// Wait until `tx` is buried under `confirmations` blocks.
    ///
    /// Returns `Ok(None)` if that does not happen within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the node cannot be reached.
    async fn wait_for_confirmations(
        &self,
        tx: &TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Option<Receipt>>;
}

/// Number of confirmations a block at `included` has when `latest` is the head.
#[must_use]
pub fn confirmations_at(included: u64, latest: u64) -> u64 {
    if latest < included {
        0
    } else {
        latest - included + 1
    }
}
