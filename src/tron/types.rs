//! TRON contract types, transaction payloads and error definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::{Classify, ErrorKind};
use crate::http::TransportError;
use crate::tron::action::ActionStep;
use crate::tron::address::TronAddress;
use crate::wallet::KeyError;

/// Largest amount accepted for a TRX transfer (2^53 - 1 sun).
///
/// Gateways parse amounts as IEEE doubles; anything above loses precision.
pub const MAX_SAFE_SUN: u64 = (1 << 53) - 1;

/// Sun per TRX.
pub const SUN_PER_TRX: u64 = 1_000_000;

/// Contract kinds the client builds, with their protocol codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    Transfer,
    VoteWitness,
    WithdrawBalance,
    TriggerSmartContract,
    FreezeBalanceV2,
    UnfreezeBalanceV2,
    WithdrawExpireUnfreeze,
}

impl ContractType {
    /// Numeric code, also the bit index in a permission's operations bitmap.
    pub fn code(self) -> u32 {
        match self {
            ContractType::Transfer => 1,
            ContractType::VoteWitness => 4,
            ContractType::WithdrawBalance => 13,
            ContractType::TriggerSmartContract => 31,
            ContractType::FreezeBalanceV2 => 54,
            ContractType::UnfreezeBalanceV2 => 55,
            ContractType::WithdrawExpireUnfreeze => 56,
        }
    }

    /// Name used in `raw_data.contract[].type`.
    pub fn name(self) -> &'static str {
        match self {
            ContractType::Transfer => "TransferContract",
            ContractType::VoteWitness => "VoteWitnessContract",
            ContractType::WithdrawBalance => "WithdrawBalanceContract",
            ContractType::TriggerSmartContract => "TriggerSmartContract",
            ContractType::FreezeBalanceV2 => "FreezeBalanceV2Contract",
            ContractType::UnfreezeBalanceV2 => "UnfreezeBalanceV2Contract",
            ContractType::WithdrawExpireUnfreeze => "WithdrawExpireUnfreezeContract",
        }
    }

    /// Gateway endpoint that builds this contract.
    pub fn build_path(self) -> &'static str {
        match self {
            ContractType::Transfer => "/wallet/createtransaction",
            ContractType::VoteWitness => "/wallet/votewitnessaccount",
            ContractType::WithdrawBalance => "/wallet/withdrawbalance",
            ContractType::TriggerSmartContract => "/wallet/triggersmartcontract",
            ContractType::FreezeBalanceV2 => "/wallet/freezebalancev2",
            ContractType::UnfreezeBalanceV2 => "/wallet/unfreezebalancev2",
            ContractType::WithdrawExpireUnfreeze => "/wallet/withdrawexpireunfreeze",
        }
    }
}

/// Stakeable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resource {
    Bandwidth,
    Energy,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Bandwidth => "BANDWIDTH",
            Resource::Energy => "ENERGY",
        }
    }
}

impl std::str::FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BANDWIDTH" => Ok(Resource::Bandwidth),
            "ENERGY" => Ok(Resource::Energy),
            other => Err(format!("unknown resource: {}", other)),
        }
    }
}

/// One witness vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteItem {
    pub address: TronAddress,
    pub count: u64,
}

/// Reject amounts the gateway cannot represent exactly.
pub fn validate_amount(amount_sun: u64) -> TronResult<()> {
    if amount_sun == 0 {
        return Err(TronError::InvalidInput("amount must be greater than 0".into()));
    }
    if amount_sun > MAX_SAFE_SUN {
        return Err(TronError::InvalidInput(format!(
            "amount {} sun exceeds the maximum of {} sun",
            amount_sun, MAX_SAFE_SUN
        )));
    }
    Ok(())
}

/// Transaction built by a node, not yet signed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedTransaction {
    raw: Value,
}

impl UnsignedTransaction {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn as_json(&self) -> &Value {
        &self.raw
    }

    /// The id the signature covers; must be present before signing.
    pub fn tx_id(&self) -> TronResult<&str> {
        self.raw
            .get("txID")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TronError::Protocol("transaction is missing txID".into()))
    }

    pub fn raw_data_hex(&self) -> Option<&str> {
        self.raw.get("raw_data_hex").and_then(Value::as_str)
    }

    fn contract(&self) -> Option<&Value> {
        self.raw.pointer("/raw_data/contract/0")
    }

    /// The `type` name of the first contract.
    pub fn contract_name(&self) -> Option<&str> {
        self.contract()?.get("type").and_then(Value::as_str)
    }

    /// Permission id echoed by the node, whichever spelling it used.
    pub fn permission_id(&self) -> Option<u32> {
        let contract = self.contract()?;
        ["Permission_id", "permission_id", "permissionId"]
            .iter()
            .find_map(|field| contract.get(*field))
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|id| u32::try_from(id).ok())
    }

    /// Attach a hex signature.
    pub fn into_signed(mut self, signature_hex: String) -> SignedTransaction {
        if let Value::Object(map) = &mut self.raw {
            map.insert("signature".into(), Value::Array(vec![Value::String(signature_hex)]));
        }
        SignedTransaction { raw: self.raw }
    }
}

/// Transaction carrying its signature, ready to broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    raw: Value,
}

impl SignedTransaction {
    pub fn as_json(&self) -> &Value {
        &self.raw
    }

    pub fn tx_id(&self) -> &str {
        self.raw.get("txID").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn signatures(&self) -> Vec<&str> {
        self.raw
            .get("signature")
            .and_then(Value::as_array)
            .map(|sigs| sigs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// A transaction accepted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    pub txid: String,
    /// Set when the transaction had to be rebuilt under an active permission.
    pub permission_id: Option<u32>,
}

/// Flattened outcome for callers that want `{success, txid?, error?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub success: bool,
    pub txid: Option<String>,
    pub error: Option<String>,
}

impl From<TronResult<BroadcastReceipt>> for TxOutcome {
    fn from(result: TronResult<BroadcastReceipt>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                txid: Some(receipt.txid),
                error: None,
            },
            Err(err) => Self {
                success: false,
                txid: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Subset of `/wallet/getaccount`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub balance: u64,
    pub votes: Vec<VoteItem>,
    pub active_permission: Vec<crate::tron::permission::Permission>,
}

/// Subset of `/wallet/getaccountresource`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccountResource {
    #[serde(rename = "tronPowerLimit")]
    pub tron_power_limit: u64,
    #[serde(rename = "tronPowerUsed")]
    pub tron_power_used: u64,
    #[serde(rename = "EnergyLimit")]
    pub energy_limit: u64,
    #[serde(rename = "EnergyUsed")]
    pub energy_used: u64,
    #[serde(rename = "NetLimit")]
    pub net_limit: u64,
    #[serde(rename = "freeNetLimit")]
    pub free_net_limit: u64,
}

/// Errors that can occur during TRON operations.
#[derive(Debug, Error)]
pub enum TronError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rejected locally before any network call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Malformed or empty node response.
    #[error("malformed node response: {0}")]
    Protocol(String),

    /// The gateway refused the request (build or query).
    #[error("gateway error: {0}")]
    Node(String),

    /// The node refused the signed transaction.
    #[error("broadcast rejected: {message}")]
    Broadcast { code: Option<String>, message: String },

    #[error("{message} (no matching active permission found for signer)")]
    NoMatchingPermission { message: String },

    /// Executed on-chain but failed.
    #[error("transaction failed on-chain: {0}")]
    Reverted(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("{0:?} is still processing")]
    StillProcessing(ActionStep),
}

impl TronError {
    /// Signer lacks weight under the permission the transaction was built with.
    pub fn is_permission_mismatch(&self) -> bool {
        match self {
            TronError::Broadcast { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("not contained of permission")
                    || lower.contains("validate signature error")
            }
            _ => false,
        }
    }
}

impl Classify for TronError {
    fn kind(&self) -> ErrorKind {
        match self {
            TronError::Transport(err) => err.kind(),
            TronError::InvalidInput(_) | TronError::Key(_) => ErrorKind::InvalidInput,
            TronError::Protocol(_) => ErrorKind::Protocol,
            TronError::NoMatchingPermission { .. } => ErrorKind::PermissionMismatch,
            TronError::Reverted(_) => ErrorKind::Consensus,
            TronError::StillProcessing(_) => ErrorKind::StateConflict,
            TronError::Node(message) | TronError::Broadcast { message, .. } => {
                ErrorKind::from_message(message)
            }
        }
    }
}

/// Result type for TRON operations.
pub type TronResult<T> = Result<T, TronError>;
