use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use passport_core::{Digest, PassportId};

use crate::Result;

/// Explicit fee settings for a submission. Any value set here is used as is and bypasses the
/// fee strategy for that value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeOverrides {
    /// Gas limit for the anchor call.
    pub gas_limit: Option<u64>,
    /// EIP-1559 max fee per gas in wei.
    pub max_fee_per_gas: Option<u128>,
    /// EIP-1559 priority fee per gas in wei.
    pub max_priority_fee_per_gas: Option<u128>,
    /// Legacy gas price in wei.
    pub gas_price: Option<u128>,
}

/// Arguments of the contract's `anchor` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorCall {
    pub passport_id: PassportId,
    pub digest: Digest,
    pub algo: String,
    pub uri: String,
    pub version: u64,
    pub fees: FeeOverrides,
}

/// The parts of a transaction receipt anchoring cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_hash: String,
    /// Receipt status is success.
    pub success: bool,
    pub block_number: u64,
}

/// A decoded `Anchored` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorEvent {
    pub passport_id: PassportId,
    pub digest: Digest,
    pub algo: String,
    pub uri: String,
    pub version: u64,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// Access to the anchor contract on a chain.
///
/// Implementations own endpoint selection, fees and signing. Every method may be called
/// concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnchorChain: Send + Sync {
    /// Sign and broadcast an anchor call, returning the `0x` prefixed transaction hash without
    /// waiting for it to be mined.
    async fn submit(&self, call: &AnchorCall) -> Result<String>;

    /// Wait for the transaction to be mined with a bounded timeout.
    ///
    /// Returns [`crate::Error::ConfirmationTimeout`] when no receipt appears in time.
    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt>;

    /// Fetch the receipt if the transaction has been mined.
    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>>;

    /// Timestamp of a block, if the block is known.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<DateTime<Utc>>>;

    /// Every `Anchored` event for the id between the configured start block and the current head.
    async fn anchor_events(&self, passport_id: &PassportId) -> Result<Vec<AnchorEvent>>;
}
