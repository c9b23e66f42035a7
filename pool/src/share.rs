use num_rational::BigRational;
use serde::{Deserialize, Serialize};

/// A unit of work credited to a pool account, weighted by the difficulty
/// of the work performed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub account: String,
    pub weight: BigRational,
    pub created_on: i64,
}

impl Share {
    pub fn new(account: String, weight: BigRational, created_on: i64) -> Self {
        Self {
            account,
            weight,
            created_on,
        }
    }

    /// The storage key of the share: the big-endian creation time
    /// followed by the account id, so shares iterate in time order.
    pub fn key(&self) -> Vec<u8> {
        share_key(self.created_on, &self.account)
    }
}

pub fn share_key(created_on: i64, account: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + account.len());
    key.extend_from_slice(&(created_on as u64).to_be_bytes());
    key.extend_from_slice(account.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_by_time_then_account() {
        let a = share_key(1, "zzz");
        let b = share_key(2, "aaa");
        let c = share_key(2, "bbb");
        assert!(a < b);
        assert!(b < c);
    }
}
