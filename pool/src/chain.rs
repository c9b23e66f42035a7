use bech32::{self, FromBase32, ToBase32, Variant};

use crate::error::PoolError;

/// Serialized length of a transparent payout address payload: a version
/// byte followed by a 20-byte public key hash.
const ADDRESS_PAYLOAD_LEN: usize = 21;

/// Consensus and encoding parameters for the network being mined on.
///
/// Only the subset the payout engine needs is carried here: the coinbase
/// maturity window and the human-readable part under which payout
/// addresses decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainParams {
    pub name: &'static str,
    pub address_hrp: &'static str,
    pub coinbase_maturity: u16,
}

pub const MAINNET: ChainParams = ChainParams {
    name: "mainnet",
    address_hrp: "hgm",
    coinbase_maturity: 256,
};

pub const TESTNET: ChainParams = ChainParams {
    name: "testnet",
    address_hrp: "thgm",
    coinbase_maturity: 256,
};

pub const SIMNET: ChainParams = ChainParams {
    name: "simnet",
    address_hrp: "shgm",
    coinbase_maturity: 16,
};

impl ChainParams {
    pub fn from_name(name: &str) -> Result<Self, PoolError> {
        match name {
            "mainnet" => Ok(MAINNET),
            "testnet" => Ok(TESTNET),
            "simnet" => Ok(SIMNET),
            other => Err(PoolError::Decode(format!("unknown network {other}"))),
        }
    }
}

/// A transparent payout address: a version byte plus a 20-byte pubkey
/// hash, bech32m-encoded under the network HRP.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    version: u8,
    pubkey_hash: [u8; 20],
    hrp: &'static str,
}

impl Address {
    pub fn new(version: u8, pubkey_hash: [u8; 20], params: &ChainParams) -> Self {
        Self {
            version,
            pubkey_hash,
            hrp: params.address_hrp,
        }
    }

    /// Decodes a payout address string under the provided network
    /// parameters.
    pub fn decode(address: &str, params: &ChainParams) -> Result<Self, PoolError> {
        let (hrp, data, variant) =
            bech32::decode(address).map_err(|err| PoolError::Decode(err.to_string()))?;
        if hrp != params.address_hrp {
            return Err(PoolError::Decode(format!(
                "invalid HRP: expected {}, got {hrp}",
                params.address_hrp
            )));
        }
        if variant != Variant::Bech32m {
            return Err(PoolError::Decode("unsupported address variant".into()));
        }
        let bytes =
            Vec::<u8>::from_base32(&data).map_err(|err| PoolError::Decode(err.to_string()))?;
        if bytes.len() != ADDRESS_PAYLOAD_LEN {
            return Err(PoolError::Decode(format!(
                "invalid address payload length {}",
                bytes.len()
            )));
        }
        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&bytes[1..]);
        Ok(Self {
            version: bytes[0],
            pubkey_hash,
            hrp: params.address_hrp,
        })
    }

    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(ADDRESS_PAYLOAD_LEN);
        payload.push(self.version);
        payload.extend_from_slice(&self.pubkey_hash);
        bech32::encode(self.hrp, payload.to_base32(), Variant::Bech32m)
            .expect("static HRP is always encodable")
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Parses a hex-encoded 32-byte chain hash.
pub fn parse_hash(hash: &str) -> Result<[u8; 32], PoolError> {
    let bytes =
        hex::decode(hash).map_err(|err| PoolError::CreateHash(format!("invalid hash: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| PoolError::CreateHash(format!("invalid hash length for {hash}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let addr = Address::new(0, [7; 20], &SIMNET);
        let encoded = addr.encode();
        let decoded = Address::decode(&encoded, &SIMNET).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn rejects_wrong_network() {
        let addr = Address::new(0, [7; 20], &SIMNET).encode();
        let err = Address::decode(&addr, &MAINNET).unwrap_err();
        assert!(matches!(err, PoolError::Decode(_)));
    }

    #[test]
    fn rejects_garbage() {
        let err = Address::decode("not-an-address", &MAINNET).unwrap_err();
        assert!(matches!(err, PoolError::Decode(_)));
    }

    #[test]
    fn hash_parsing() {
        let hash = parse_hash(&hex::encode([5u8; 32])).unwrap();
        assert_eq!(hash, [5u8; 32]);
        assert!(parse_hash("zz").is_err());
        assert!(parse_hash("0102").is_err());
    }
}
