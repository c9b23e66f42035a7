//! JSON-RPC client implementations of the payment engine's chain and
//! wallet seams, backed by WebSocket connections to the node and wallet
//! daemons.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use tokio::sync::mpsc;

use pool::{
    Address, ConfNotifReceiver, ConfirmationBatch, GetTxOutResult, PoolError, PoolResult,
    PublishTransactionRequest, PublishTransactionResponse, SignTransactionRequest,
    SignTransactionResponse, TransactionInput, TxBroadcaster, TxCreator,
};

fn rpc_error(err: jsonrpsee::core::ClientError) -> PoolError {
    PoolError::Disconnected(err.to_string())
}

/// Chain node client providing coinbase lookups and payout transaction
/// creation.
pub struct NodeClient {
    client: Arc<WsClient>,
}

impl NodeClient {
    pub async fn connect(endpoint: &str) -> PoolResult<Self> {
        let client = WsClientBuilder::default()
            .build(endpoint)
            .await
            .map_err(rpc_error)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// The height of the current best block, used to drive dividend
    /// ticks.
    pub async fn best_block_height(&self) -> PoolResult<u32> {
        self.client
            .request("hegemon_bestBlockHeight", rpc_params![])
            .await
            .map_err(rpc_error)
    }

    /// Whether the treasury consensus rule is active at the current tip.
    pub async fn treasury_active(&self) -> PoolResult<bool> {
        self.client
            .request("hegemon_treasuryActive", rpc_params![])
            .await
            .map_err(rpc_error)
    }
}

#[async_trait]
impl TxCreator for NodeClient {
    async fn get_tx_out(
        &self,
        txid: &str,
        vout: u32,
        include_mempool: bool,
    ) -> PoolResult<Option<GetTxOutResult>> {
        self.client
            .request("hegemon_getTxOut", rpc_params![txid, vout, include_mempool])
            .await
            .map_err(rpc_error)
    }

    async fn create_raw_transaction(
        &self,
        inputs: &[TransactionInput],
        outputs: &HashMap<Address, i64>,
        lock_time: Option<i64>,
        expiry: Option<i64>,
    ) -> PoolResult<Vec<u8>> {
        let outputs: HashMap<String, i64> = outputs
            .iter()
            .map(|(address, amount)| (address.encode(), *amount))
            .collect();
        let tx: String = self
            .client
            .request(
                "hegemon_createRawTransaction",
                rpc_params![inputs, outputs, lock_time, expiry],
            )
            .await
            .map_err(rpc_error)?;
        hex::decode(&tx).map_err(|err| PoolError::CreateTx(format!("malformed raw tx: {err}")))
    }

    async fn get_block_confirmations(&self, block_hash: &str) -> PoolResult<i64> {
        self.client
            .request("hegemon_getBlockConfirmations", rpc_params![block_hash])
            .await
            .map_err(rpc_error)
    }
}

/// Wallet client providing signing, broadcasting and confirmation
/// notification streams.
pub struct WalletClient {
    client: Arc<WsClient>,
    wallet_account: u32,
}

impl WalletClient {
    pub async fn connect(endpoint: &str, wallet_account: u32) -> PoolResult<Self> {
        let client = WsClientBuilder::default()
            .build(endpoint)
            .await
            .map_err(rpc_error)?;
        Ok(Self {
            client: Arc::new(client),
            wallet_account,
        })
    }
}

#[async_trait]
impl TxBroadcaster for WalletClient {
    async fn sign_transaction(
        &self,
        request: SignTransactionRequest,
    ) -> PoolResult<SignTransactionResponse> {
        let signed: String = self
            .client
            .request(
                "wallet_signTransaction",
                rpc_params![
                    hex::encode(&request.serialized_transaction),
                    request.passphrase,
                    self.wallet_account
                ],
            )
            .await
            .map_err(rpc_error)?;
        let transaction = hex::decode(&signed)
            .map_err(|err| PoolError::SignTx(format!("malformed signed tx: {err}")))?;
        Ok(SignTransactionResponse { transaction })
    }

    async fn publish_transaction(
        &self,
        request: PublishTransactionRequest,
    ) -> PoolResult<PublishTransactionResponse> {
        let transaction_hash: String = self
            .client
            .request(
                "wallet_publishTransaction",
                rpc_params![hex::encode(&request.signed_transaction)],
            )
            .await
            .map_err(rpc_error)?;
        Ok(PublishTransactionResponse { transaction_hash })
    }

    async fn confirmation_notifications(
        &self,
        tx_hashes: Vec<String>,
        stop_after_height: i32,
    ) -> PoolResult<ConfNotifReceiver> {
        let mut subscription: Subscription<ConfirmationBatch> = self
            .client
            .subscribe(
                "wallet_subscribeTxConfirmations",
                rpc_params![tx_hashes, stop_after_height],
                "wallet_unsubscribeTxConfirmations",
            )
            .await
            .map_err(rpc_error)?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(batch) = subscription.next().await {
                let item = batch.map_err(|err| PoolError::TxConf(err.to_string()));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
