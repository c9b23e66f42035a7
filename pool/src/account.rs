use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::payment::now_nanos;

/// A registered pool account. Accounts are created by the registration
/// flow upstream and referenced by payments through their id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub uuid: String,
    pub address: String,
    pub created_on: i64,
}

/// Derives the account id for a payout address.
pub fn account_id(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    hex::encode(digest)
}

impl Account {
    pub fn new(address: String) -> Self {
        Self {
            uuid: account_id(&address),
            address,
            created_on: now_nanos(),
        }
    }
}
