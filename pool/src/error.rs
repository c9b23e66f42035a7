use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unable to open database: {0}")]
    DbOpen(String),
    #[error("unable to create bucket: {0}")]
    BucketCreate(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("unable to persist entry: {0}")]
    PersistEntry(String),
    #[error("unable to delete entry: {0}")]
    DeleteEntry(String),
    #[error("value not found: {0}")]
    ValueNotFound(String),
    #[error("unable to backup database: {0}")]
    Backup(String),
    #[error("invalid share ratios: {0}")]
    ShareRatio(String),
    #[error("division by zero: {0}")]
    DivideByZero(String),
    #[error("invalid payment source: {0}")]
    PaymentSource(String),
    #[error("unable to create hash: {0}")]
    CreateHash(String),
    #[error("unable to create amount: {0}")]
    CreateAmount(String),
    #[error("invalid transaction input: {0}")]
    TxIn(String),
    #[error("invalid transaction output: {0}")]
    TxOut(String),
    #[error("coinbase not spendable: {0}")]
    Coinbase(String),
    #[error("unable to create transaction: {0}")]
    CreateTx(String),
    #[error("unable to sign transaction: {0}")]
    SignTx(String),
    #[error("unable to publish transaction: {0}")]
    PublishTx(String),
    #[error("unable to decode address: {0}")]
    Decode(String),
    #[error("client disconnected: {0}")]
    Disconnected(String),
    #[error("unable to confirm transaction: {0}")]
    TxConf(String),
    #[error("context cancelled: {0}")]
    ContextCancelled(String),
    #[error("unknown payment method {0}")]
    UnknownPaymentMethod(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl PoolError {
    /// Reports whether the error originates from a cancelled or timed out
    /// dividend context. Callers treat these as a graceful abort rather
    /// than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PoolError::ContextCancelled(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
