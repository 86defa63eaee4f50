//! Raw signing key handed to the core by the caller.
//!
//! # Security
//! - Keys are parsed from hex or read from an environment variable
//! - Keys are never logged or serialized; `Debug` prints the address only
//! - The same secp256k1 key signs for TRON and EVM accounts

use alloy::primitives::{Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use thiserror::Error;

use crate::tron::address::TronAddress;

/// Environment variable name for the private key.
pub const PRIVATE_KEY_ENV_VAR: &str = "WALLET_ENGINE_PRIVATE_KEY";

/// Errors raised while loading or using a key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid private key format: {0}")]
    InvalidKey(String),

    #[error("Environment variable {0} not set")]
    MissingEnv(&'static str),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// secp256k1 private key.
#[derive(Clone)]
pub struct SigningKey {
    signer: PrivateKeySigner,
}

impl SigningKey {
    /// Parse a hex-encoded private key (with or without 0x prefix).
    pub fn from_hex(private_key_hex: &str) -> Result<Self, KeyError> {
        let key_hex = private_key_hex
            .trim()
            .strip_prefix("0x")
            .unwrap_or(private_key_hex.trim());

        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| KeyError::InvalidKey(format!("{}", e)))?;

        Ok(Self { signer })
    }

    /// Load the key from `WALLET_ENGINE_PRIVATE_KEY`.
    pub fn from_env() -> Result<Self, KeyError> {
        let private_key = std::env::var(PRIVATE_KEY_ENV_VAR)
            .map_err(|_| KeyError::MissingEnv(PRIVATE_KEY_ENV_VAR))?;
        Self::from_hex(&private_key)
    }

    /// EVM account address.
    pub fn evm_address(&self) -> Address {
        self.signer.address()
    }

    /// TRON account address (0x41 followed by the EVM address bytes).
    pub fn tron_address(&self) -> TronAddress {
        TronAddress::from_evm(self.signer.address())
    }

    /// Sign a 32-byte digest as-is.
    ///
    /// Returns the 65-byte `r ‖ s ‖ v` layout, `v` being 27 or 28.
    pub fn sign_digest(&self, digest: &B256) -> Result<[u8; 65], KeyError> {
        self.sign_hash(digest).map(|sig| sig.as_bytes())
    }

    /// Sign with `eth_sign` semantics (EIP-191 personal message prefix).
    pub fn sign_eth_message(&self, message: &[u8]) -> Result<[u8; 65], KeyError> {
        self.signer
            .sign_message_sync(message)
            .map(|sig| sig.as_bytes())
            .map_err(|e| KeyError::Signing(e.to_string()))
    }

    /// Sign a digest and keep the structured signature (for transaction envelopes).
    pub fn sign_hash(&self, digest: &B256) -> Result<Signature, KeyError> {
        self.signer
            .sign_hash_sync(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("address", &self.signer.address())
            .finish_non_exhaustive()
    }
}
