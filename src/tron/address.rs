//! TRON address codec.
//!
//! A TRON address is a 21-byte payload (`0x41` followed by the 20-byte
//! account hash). It is displayed as Base58Check: the payload plus a 4-byte
//! double-SHA-256 checksum, 25 bytes in total.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{hex, Address};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Version byte of mainnet (and testnet) addresses.
pub const ADDRESS_PREFIX: u8 = 0x41;

const PAYLOAD_LEN: usize = 21;
const ENCODED_LEN: usize = PAYLOAD_LEN + 4;

/// Double SHA-256 checksum (first 4 bytes).
fn double_sha256_checksum(data: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&second[..4]);
    checksum
}

/// Base58Check → canonical lowercase hex of the 21-byte payload.
///
/// Returns an empty string when the input does not decode to exactly 25
/// bytes or its checksum does not match.
pub fn to_canonical_hex(base58: &str) -> String {
    decode_base58(base58)
        .map(hex::encode)
        .unwrap_or_default()
}

/// Hex payload → Base58Check display form.
///
/// The checksum is always derived here. Accepts an optional `0x` prefix;
/// returns an empty string unless the input is exactly 21 bytes of hex.
pub fn to_display(hex_payload: &str) -> String {
    decode_hex(hex_payload)
        .map(|payload| encode_base58(&payload))
        .unwrap_or_default()
}

fn decode_base58(base58: &str) -> Option<[u8; PAYLOAD_LEN]> {
    let decoded = bs58::decode(base58.trim()).into_vec().ok()?;
    if decoded.len() != ENCODED_LEN {
        return None;
    }

    let (payload, checksum) = decoded.split_at(PAYLOAD_LEN);
    if checksum != double_sha256_checksum(payload) {
        return None;
    }

    payload.try_into().ok()
}

fn decode_hex(value: &str) -> Option<[u8; PAYLOAD_LEN]> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).ok()?;
    bytes.as_slice().try_into().ok()
}

fn encode_base58(payload: &[u8; PAYLOAD_LEN]) -> String {
    let mut full = Vec::with_capacity(ENCODED_LEN);
    full.extend_from_slice(payload);
    full.extend_from_slice(&double_sha256_checksum(payload));
    bs58::encode(full).into_string()
}

/// Validated 21-byte TRON address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TronAddress([u8; PAYLOAD_LEN]);

impl TronAddress {
    /// Wrap a raw payload.
    pub fn from_bytes(payload: [u8; PAYLOAD_LEN]) -> Self {
        Self(payload)
    }

    /// The TRON account controlled by the same key as an EVM account.
    pub fn from_evm(address: Address) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = ADDRESS_PREFIX;
        payload[1..].copy_from_slice(address.as_slice());
        Self(payload)
    }

    /// Accepts either Base58Check (`T...`) or 21-byte hex.
    pub fn parse(value: &str) -> Option<Self> {
        decode_base58(value).or_else(|| decode_hex(value)).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    /// The 20-byte account hash, as used in contract ABI arguments.
    pub fn to_evm(&self) -> Address {
        Address::from_slice(&self.0[1..])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base58(&self) -> String {
        encode_base58(&self.0)
    }
}

impl fmt::Display for TronAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for TronAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TronAddress({})", self.to_base58())
    }
}

impl FromStr for TronAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid TRON address: {}", s))
    }
}

impl Serialize for TronAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for TronAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
