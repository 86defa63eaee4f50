//! Active-permission selection for accounts whose owner key is not the signer.
//!
//! # Selection order
//! ```text
//! candidates = active permissions where signer weight >= threshold
//!   1. operations bitmap allows the contract type
//!   2. operations bitmap missing or unreadable
//!   3. first candidate
//! ```

use serde::Deserialize;
use serde_json::{json, Value};

use crate::tron::address::TronAddress;
use crate::tron::types::ContractType;

/// Ways a gateway may expect the permission id in a build request.
///
/// Tried in order; gateways silently drop the ones they do not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionField {
    /// `"Permission_id": 2`
    CapitalSnake,
    /// `"permission_id": 2`
    Snake,
    /// `"permissionId": 2`
    Camel,
    /// `"Permission_id": "2"`
    CapitalSnakeString,
}

pub const PERMISSION_FIELD_VARIANTS: [PermissionField; 4] = [
    PermissionField::CapitalSnake,
    PermissionField::Snake,
    PermissionField::Camel,
    PermissionField::CapitalSnakeString,
];

impl PermissionField {
    pub fn key(self) -> &'static str {
        match self {
            PermissionField::CapitalSnake | PermissionField::CapitalSnakeString => "Permission_id",
            PermissionField::Snake => "permission_id",
            PermissionField::Camel => "permissionId",
        }
    }

    pub fn value(self, id: u32) -> Value {
        match self {
            PermissionField::CapitalSnakeString => json!(id.to_string()),
            _ => json!(id),
        }
    }

    /// Insert the id into a request body.
    pub fn apply(self, body: &mut Value, id: u32) {
        if let Value::Object(map) = body {
            map.insert(self.key().to_string(), self.value(id));
        }
    }
}

/// One key in a permission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PermissionKey {
    pub address: String,
    #[serde(default)]
    pub weight: u64,
}

/// An account permission as returned by `getaccount`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub permission_name: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// 32-byte hex bitmap of allowed contract types.
    #[serde(default)]
    pub operations: Option<String>,
    #[serde(default)]
    pub keys: Vec<PermissionKey>,
}

fn default_threshold() -> u64 {
    1
}

impl Permission {
    /// Combined weight of the signer's keys in this permission.
    pub fn signer_weight(&self, signer: &TronAddress) -> u64 {
        self.keys
            .iter()
            .filter(|key| TronAddress::parse(&key.address).as_ref() == Some(signer))
            .map(|key| key.weight)
            .sum()
    }

    /// Whether the signer alone meets the threshold.
    pub fn qualifies(&self, signer: &TronAddress) -> bool {
        self.signer_weight(signer) >= self.threshold.max(1)
    }

    /// `None` when the bitmap is absent or unreadable.
    pub fn allows(&self, contract: ContractType) -> Option<bool> {
        let hex = self.operations.as_deref()?.trim();
        if hex.is_empty() {
            return None;
        }
        let bytes = alloy::primitives::hex::decode(hex).ok()?;
        let bit = contract.code() as usize;
        let byte = bytes.get(bit / 8)?;
        Some(byte & (1 << (bit % 8)) != 0)
    }
}

/// Pick the active permission to rebuild under, if any qualifies.
pub fn select_permission<'a>(
    permissions: &'a [Permission],
    signer: &TronAddress,
    contract: ContractType,
) -> Option<&'a Permission> {
    let candidates: Vec<&Permission> = permissions.iter().filter(|p| p.qualifies(signer)).collect();

    candidates
        .iter()
        .find(|p| p.allows(contract) == Some(true))
        .or_else(|| candidates.iter().find(|p| p.allows(contract).is_none()))
        .or_else(|| candidates.first())
        .copied()
}
