//! Failure taxonomy shared by every chain.
//!
//! Each subsystem keeps its own `thiserror` enum; this module gives callers
//! one way to branch on *what kind* of failure happened without matching
//! chain-specific variants.

use serde::{Deserialize, Serialize};

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout, DNS, connection refused, rate limited.
    Transport,
    /// Malformed or empty response, missing transaction id.
    Protocol,
    /// Signer lacks weight under the permission used to build the transaction.
    PermissionMismatch,
    /// Insufficient funds, energy or bandwidth, amount below dust.
    Economic,
    /// On-chain revert.
    Consensus,
    /// Nonce conflicts and duplicate in-flight actions.
    StateConflict,
    /// Rejected locally before any network call.
    InvalidInput,
}

impl ErrorKind {
    /// Guess the category of a free-form node message.
    ///
    /// Used where a node reports failures as text only.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        const ECONOMIC: &[&str] = &[
            "insufficient",
            "balance is not sufficient",
            "not enough",
            "account resource insufficient",
            "less than",
            "dust",
        ];
        const STATE: &[&str] = &["nonce", "underpriced", "dup_transaction", "duplicate"];
        const CONSENSUS: &[&str] = &["revert", "gs0", "gs1", "gs2", "gs3"];
        const PERMISSION: &[&str] = &[
            "not contained of permission",
            "validate signature error",
            "permission denied",
        ];

        if PERMISSION.iter().any(|p| lower.contains(p)) {
            ErrorKind::PermissionMismatch
        } else if STATE.iter().any(|p| lower.contains(p)) {
            ErrorKind::StateConflict
        } else if ECONOMIC.iter().any(|p| lower.contains(p)) {
            ErrorKind::Economic
        } else if CONSENSUS.iter().any(|p| lower.contains(p)) {
            ErrorKind::Consensus
        } else {
            ErrorKind::Protocol
        }
    }
}

/// Implemented by every error type the engine returns.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Only transport failures are worth retrying blindly.
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_classification() {
        assert_eq!(
            ErrorKind::from_message("Validate signature error: sig error"),
            ErrorKind::PermissionMismatch
        );
        assert_eq!(
            ErrorKind::from_message("nonce too low: next nonce 7, tx nonce 5"),
            ErrorKind::StateConflict
        );
        assert_eq!(
            ErrorKind::from_message("balance is not sufficient"),
            ErrorKind::Economic
        );
        assert_eq!(
            ErrorKind::from_message("execution reverted: GS013"),
            ErrorKind::Consensus
        );
        assert_eq!(ErrorKind::from_message("weird"), ErrorKind::Protocol);
    }
}
