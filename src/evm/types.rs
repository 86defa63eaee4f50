//! EVM error types.

use alloy::primitives::{Address, B256};
use thiserror::Error;

use crate::errors::{Classify, ErrorKind};
use crate::http::TransportError;
use crate::wallet::KeyError;

/// A JSON-RPC failure. Cloneable so concurrent callers can share one result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error object returned by the node.
    #[error("RPC error {code}: {message}")]
    Node {
        code: i64,
        message: String,
        data: Option<String>,
    },

    #[error("malformed RPC response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Message plus revert data, for keyword and revert-code matching.
    pub fn full_text(&self) -> String {
        match self {
            RpcError::Node {
                message,
                data: Some(data),
                ..
            } => format!("{} {}", message, data),
            other => other.to_string(),
        }
    }
}

impl Classify for RpcError {
    fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Transport(err) => err.kind(),
            RpcError::Malformed(_) => ErrorKind::Protocol,
            RpcError::Node { .. } => ErrorKind::from_message(&self.full_text()),
        }
    }
}

/// Errors that can occur during EVM operations.
#[derive(Debug, Error)]
pub enum EvmError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Rejected for nonce reasons; the counter has been reset.
    #[error("Nonce error: {0}")]
    Nonce(String),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("{0} is not an owner of this Safe")]
    NotOwner(Address),

    #[error("not enough signatures: {have} of {threshold}")]
    BelowThreshold { have: usize, threshold: u64 },

    #[error("no pending Safe transaction {0}")]
    UnknownSafeTx(B256),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Classify for EvmError {
    fn kind(&self) -> ErrorKind {
        match self {
            EvmError::Rpc(err) => err.kind(),
            EvmError::GasPriceTooHigh { .. } => ErrorKind::Economic,
            EvmError::Nonce(_) => ErrorKind::StateConflict,
            EvmError::Reverted(_) => ErrorKind::Consensus,
            EvmError::ChainMismatch { .. } => ErrorKind::Protocol,
            EvmError::NotOwner(_) => ErrorKind::PermissionMismatch,
            EvmError::BelowThreshold { .. } | EvmError::UnknownSafeTx(_) => ErrorKind::StateConflict,
            EvmError::Key(_) | EvmError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Result type for EVM operations.
pub type EvmResult<T> = Result<T, EvmError>;
