pub mod account;
pub mod chain;
pub mod error;
pub mod payment;
pub mod paymentmgr;
pub mod rpc;
pub mod share;
pub mod store;
pub mod txrules;

pub use account::{account_id, Account};
pub use chain::{parse_hash, Address, ChainParams, MAINNET, SIMNET, TESTNET};
pub use error::{PoolError, PoolResult};
pub use payment::{now_nanos, Payment, PaymentSource, POOL_FEES_ID};
pub use paymentmgr::{PaymentMethod, PaymentMgr, PaymentMgrConfig, MAX_ROUNDING_DIFF};
pub use rpc::{
    ConfNotifReceiver, ConfirmationBatch, GetTxOutResult, PublishTransactionRequest,
    PublishTransactionResponse, SignTransactionRequest, SignTransactionResponse,
    TransactionInput, TxBroadcaster, TxConfirmation, TxCreator, TX_TREE_REGULAR,
};
pub use share::{share_key, Share};
pub use store::{PoolStore, DB_VERSION};
