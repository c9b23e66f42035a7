use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Account id reserved for pool fee payouts. No real account may
/// register under it.
pub const POOL_FEES_ID: &str = "fees";

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

/// Identifies the mined block and coinbase transaction funding a batch of
/// payments. Hashes are stored hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSource {
    pub block_hash: String,
    pub coinbase: String,
}

/// A payment owed to a participating account from a mined block.
///
/// A payment is pending while `paid_on_height` is zero, mature once the
/// chain reaches `estimated_maturity`, paid when it carries a transaction
/// id, and finally archived for auditing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub account: String,
    pub source: PaymentSource,
    pub amount: i64,
    pub height: u32,
    pub estimated_maturity: u32,
    pub created_on: i64,
    pub paid_on_height: u32,
    pub transaction_id: String,
}

impl Payment {
    pub fn new(
        account: String,
        source: PaymentSource,
        amount: i64,
        height: u32,
        estimated_maturity: u32,
    ) -> Self {
        Self {
            account,
            source,
            amount,
            height,
            estimated_maturity,
            created_on: now_nanos(),
            paid_on_height: 0,
            transaction_id: String::new(),
        }
    }

    /// The storage key of the payment, identical in the live and archive
    /// buckets: big-endian height, big-endian creation time, account id.
    pub fn key(&self) -> Vec<u8> {
        payment_key(self.height, self.created_on, &self.account)
    }
}

pub fn payment_key(height: u32, created_on: i64, account: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 8 + account.len());
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&(created_on as u64).to_be_bytes());
    key.extend_from_slice(account.as_bytes());
    key
}
