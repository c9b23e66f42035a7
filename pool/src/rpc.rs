use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chain::Address;
use crate::error::PoolResult;

/// Transaction tree holding regular (non-stake) transactions.
pub const TX_TREE_REGULAR: i8 = 0;

/// An unspent output as reported by the chain node. The value is in coin
/// units, not atoms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTxOutResult {
    pub value: f64,
    pub confirmations: i64,
}

/// A transaction input referencing a previous output, in the form the
/// chain node's raw-transaction API expects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInput {
    pub amount: f64,
    pub txid: String,
    pub vout: u32,
    pub tree: i8,
}

#[derive(Clone, Debug)]
pub struct SignTransactionRequest {
    pub serialized_transaction: Vec<u8>,
    pub passphrase: String,
}

#[derive(Clone, Debug)]
pub struct SignTransactionResponse {
    pub transaction: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct PublishTransactionRequest {
    pub signed_transaction: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct PublishTransactionResponse {
    pub transaction_hash: String,
}

/// A single transaction confirmation report from the wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub tx_hash: String,
    pub confirmations: i32,
}

/// One batch of confirmation reports from the wallet's notification
/// stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmationBatch {
    pub confirmations: Vec<TxConfirmation>,
}

/// Receiving side of a confirmation notification stream. The producer
/// feeds one batch at a time through a single-slot channel.
pub type ConfNotifReceiver = mpsc::Receiver<PoolResult<ConfirmationBatch>>;

/// Functionality needed from the chain node to assemble payout
/// transactions.
#[async_trait]
pub trait TxCreator: Send + Sync {
    /// Fetches the output referenced by the provided transaction hash and
    /// index. Returns `None` if the output does not exist or is spent.
    async fn get_tx_out(
        &self,
        txid: &str,
        vout: u32,
        include_mempool: bool,
    ) -> PoolResult<Option<GetTxOutResult>>;

    /// Generates a serialized transaction from the provided inputs and
    /// payouts.
    async fn create_raw_transaction(
        &self,
        inputs: &[TransactionInput],
        outputs: &HashMap<Address, i64>,
        lock_time: Option<i64>,
        expiry: Option<i64>,
    ) -> PoolResult<Vec<u8>>;

    /// Returns the number of confirmations of the provided block hash.
    /// Zero or less means the block is no longer on the main chain.
    async fn get_block_confirmations(&self, block_hash: &str) -> PoolResult<i64>;
}

/// Functionality needed from the wallet to sign and broadcast payout
/// transactions.
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    /// Signs the transaction inputs, unlocking them for use.
    async fn sign_transaction(
        &self,
        request: SignTransactionRequest,
    ) -> PoolResult<SignTransactionResponse>;

    /// Broadcasts the signed transaction onto the network.
    async fn publish_transaction(
        &self,
        request: PublishTransactionRequest,
    ) -> PoolResult<PublishTransactionResponse>;

    /// Streams confirmation notifications for the provided transaction
    /// hashes until all of them are spendable or the stream stops at the
    /// provided height.
    async fn confirmation_notifications(
        &self,
        tx_hashes: Vec<String>,
        stop_after_height: i32,
    ) -> PoolResult<ConfNotifReceiver>;
}
