//! TRON gateway client.
//!
//! # Responsibilities
//! - Build, sign and broadcast protocol transactions (three phases)
//! - Recover once from permission mismatches by rebuilding under an active
//!   permission the signer can satisfy
//! - Query account, resource, reward and witness state
//!
//! Every gateway exchange goes through [`ProtocolClient::call`], which routes
//! errors through [`normalize`](crate::tron::normalize).

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolValue;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{EngineConfig, PollingConfig, TronConfig};
use crate::http::{HttpTransport, RateLimitedHttpClient};
use crate::observability::metrics;
use crate::tron::address::TronAddress;
use crate::tron::normalize;
use crate::tron::permission::{select_permission, Permission, PermissionField, PERMISSION_FIELD_VARIANTS};
use crate::tron::types::{
    validate_amount, AccountInfo, AccountResource, BroadcastReceipt, ContractType, Resource,
    SignedTransaction, TronError, TronResult, UnsignedTransaction, VoteItem,
};
use crate::tron::witness::WitnessCache;
use crate::wallet::SigningKey;

/// A contract to build, independent of permission.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub contract: ContractType,
    pub owner: TronAddress,
    pub body: Value,
}

/// Client for one or more TRON gateways sharing a limiter.
pub struct ProtocolClient<T> {
    http: RateLimitedHttpClient<T>,
    pub(crate) config: TronConfig,
    pub(crate) polling: PollingConfig,
    pub(crate) witnesses: WitnessCache,
}

impl<T: HttpTransport> ProtocolClient<T> {
    pub fn new(transport: T, config: &EngineConfig) -> Self {
        let http = RateLimitedHttpClient::new(
            transport,
            config.rate_limit.clone(),
            config.tron.rate_limited_hosts.clone(),
        );
        Self {
            http,
            config: config.tron.clone(),
            polling: config.polling.clone(),
            witnesses: WitnessCache::new(config.tron.witness_cache_ttl_secs),
        }
    }

    /// The limited transport, for inspecting per-host state.
    pub fn http(&self) -> &RateLimitedHttpClient<T> {
        &self.http
    }

    /// POST to `gateway` + `path` and parse the JSON reply.
    pub(crate) async fn call(&self, gateway: &str, path: &str, body: Value) -> TronResult<Value> {
        let url = format!("{}{}", gateway.trim_end_matches('/'), path);
        let response = self
            .http
            .post_json(&url, &body)
            .await
            .map_err(normalize::transport_error)?;

        if response.body.trim().is_empty() {
            return Err(TronError::Protocol(format!("empty response from {}", path)));
        }
        let value: Value = response
            .json()
            .map_err(|e| TronError::Protocol(format!("{}: {}", path, e)))?;

        if let Some(error) = value.get("Error").and_then(Value::as_str) {
            return Err(TronError::Node(normalize::decode_message(error)));
        }
        Ok(value)
    }

    // ---------------------------------------------------------------------
    // Three-phase submission
    // ---------------------------------------------------------------------

    /// Build once, optionally under a permission id spelled as `field`.
    async fn build_once(
        &self,
        gateway: &str,
        request: &BuildRequest,
        permission: Option<(PermissionField, u32)>,
    ) -> TronResult<UnsignedTransaction> {
        let mut body = request.body.clone();
        if let Some((field, id)) = permission {
            field.apply(&mut body, id);
        }

        let value = self.call(gateway, request.contract.build_path(), body).await?;

        let raw = if request.contract == ContractType::TriggerSmartContract {
            if value.pointer("/result/result").and_then(Value::as_bool) != Some(true) {
                let message = normalize::node_error_text(&value)
                    .unwrap_or_else(|| "contract call was not accepted".to_string());
                return Err(TronError::Node(message));
            }
            value.get("transaction").cloned().unwrap_or(Value::Null)
        } else {
            if let Some(message) = normalize::node_error_text(&value) {
                if value.get("txID").is_none() {
                    return Err(TronError::Node(message));
                }
            }
            value
        };

        let tx = UnsignedTransaction::new(raw);
        verify_built(&tx, request)?;
        Ok(tx)
    }

    /// Build, trying each permission spelling until the node echoes the id.
    pub async fn build(
        &self,
        gateway: &str,
        request: &BuildRequest,
        permission_id: Option<u32>,
    ) -> TronResult<UnsignedTransaction> {
        let Some(id) = permission_id else {
            return self.build_once(gateway, request, None).await;
        };

        let mut last_error = None;
        for field in PERMISSION_FIELD_VARIANTS {
            match self.build_once(gateway, request, Some((field, id))).await {
                Ok(tx) if tx.permission_id() == Some(id) => return Ok(tx),
                Ok(tx) => {
                    tracing::debug!(
                        field = field.key(),
                        echoed = ?tx.permission_id(),
                        permission_id = id,
                        "Gateway dropped permission id, trying next spelling"
                    );
                    last_error = Some(TronError::Node(format!(
                        "gateway did not honor permission id {}",
                        id
                    )));
                }
                Err(err @ TronError::Transport(_)) => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            TronError::Node(format!("gateway did not honor permission id {}", id))
        }))
    }

    /// Sign the node-computed transaction id.
    pub fn sign(&self, key: &SigningKey, tx: UnsignedTransaction) -> TronResult<SignedTransaction> {
        let digest = parse_tx_id(tx.tx_id()?)?;
        let signature = key.sign_digest(&digest)?;
        Ok(tx.into_signed(alloy::primitives::hex::encode(signature)))
    }

    /// Broadcast; accepted only when the node answers `result: true`.
    pub async fn broadcast(&self, gateway: &str, tx: &SignedTransaction) -> TronResult<String> {
        let value = self
            .call(gateway, "/wallet/broadcasttransaction", tx.as_json().clone())
            .await?;

        if value.get("result").and_then(Value::as_bool) == Some(true) {
            let txid = value
                .get("txid")
                .and_then(Value::as_str)
                .unwrap_or_else(|| tx.tx_id())
                .to_string();
            metrics::record_broadcast("tron", "accepted");
            return Ok(txid);
        }

        metrics::record_broadcast("tron", "rejected");
        Err(TronError::Broadcast {
            code: value.get("code").and_then(Value::as_str).map(str::to_string),
            message: normalize::node_error_text(&value)
                .unwrap_or_else(|| "broadcast was not accepted".to_string()),
        })
    }

    /// Build → sign → broadcast, with one permission fallback.
    pub async fn submit(
        &self,
        gateway: &str,
        key: &SigningKey,
        request: BuildRequest,
    ) -> TronResult<BroadcastReceipt> {
        let tx = self.build(gateway, &request, None).await?;
        let signed = self.sign(key, tx)?;

        let original = match self.broadcast(gateway, &signed).await {
            Ok(txid) => {
                tracing::info!(
                    txid = %txid,
                    contract = request.contract.name(),
                    "Transaction broadcast"
                );
                return Ok(BroadcastReceipt {
                    txid,
                    permission_id: None,
                });
            }
            Err(err) if err.is_permission_mismatch() => err,
            Err(err) => return Err(err),
        };

        tracing::warn!(
            error = %original,
            contract = request.contract.name(),
            "Owner permission rejected, looking for an active permission"
        );

        let account = match self.get_account(gateway, &request.owner).await {
            Ok(account) => account,
            Err(err) => {
                tracing::warn!(error = %err, "Could not load account permissions");
                return Err(original);
            }
        };

        let signer = key.tron_address();
        let Some(permission) =
            select_permission(&account.active_permission, &signer, request.contract)
        else {
            return Err(TronError::NoMatchingPermission {
                message: original.to_string(),
            });
        };
        let permission_id = permission.id;

        let tx = self.build(gateway, &request, Some(permission_id)).await?;
        let signed = self.sign(key, tx)?;
        let txid = self.broadcast(gateway, &signed).await?;

        tracing::info!(
            txid = %txid,
            permission_id,
            contract = request.contract.name(),
            "Transaction broadcast under active permission"
        );
        Ok(BroadcastReceipt {
            txid,
            permission_id: Some(permission_id),
        })
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Transfer TRX.
    pub async fn send_native_transfer(
        &self,
        gateway: &str,
        key: &SigningKey,
        to: &str,
        amount_sun: u64,
    ) -> TronResult<BroadcastReceipt> {
        validate_amount(amount_sun)?;
        let owner = key.tron_address();
        let to = parse_address(to)?;
        if to == owner {
            return Err(TronError::InvalidInput("cannot transfer to the sending account".into()));
        }

        let body = json!({
            "owner_address": owner.to_hex(),
            "to_address": to.to_hex(),
            "amount": amount_sun,
        });
        self.submit(gateway, key, request(ContractType::Transfer, owner, body)).await
    }

    /// Call `transfer(address,uint256)` on a TRC-20 contract.
    pub async fn send_token_transfer(
        &self,
        gateway: &str,
        key: &SigningKey,
        token: &str,
        to: &str,
        amount: U256,
    ) -> TronResult<BroadcastReceipt> {
        if amount.is_zero() {
            return Err(TronError::InvalidInput("amount must be greater than 0".into()));
        }
        let owner = key.tron_address();
        let token = parse_address(token)?;
        let to = parse_address(to)?;

        let recipient: Address = to.to_evm();
        let parameter = alloy::primitives::hex::encode((recipient, amount).abi_encode_params());

        let body = json!({
            "owner_address": owner.to_hex(),
            "contract_address": token.to_hex(),
            "function_selector": "transfer(address,uint256)",
            "parameter": parameter,
            "fee_limit": self.config.fee_limit_sun,
            "call_value": 0,
        });
        self.submit(gateway, key, request(ContractType::TriggerSmartContract, owner, body))
            .await
    }

    /// Stake TRX for a resource.
    pub async fn stake(
        &self,
        gateway: &str,
        key: &SigningKey,
        amount_sun: u64,
        resource: Resource,
    ) -> TronResult<BroadcastReceipt> {
        validate_amount(amount_sun)?;
        let owner = key.tron_address();
        let body = json!({
            "owner_address": owner.to_hex(),
            "frozen_balance": amount_sun,
            "resource": resource.as_str(),
        });
        self.submit(gateway, key, request(ContractType::FreezeBalanceV2, owner, body))
            .await
    }

    /// Start unstaking; funds become withdrawable after the waiting period.
    pub async fn unstake(
        &self,
        gateway: &str,
        key: &SigningKey,
        amount_sun: u64,
        resource: Resource,
    ) -> TronResult<BroadcastReceipt> {
        validate_amount(amount_sun)?;
        let owner = key.tron_address();
        let body = json!({
            "owner_address": owner.to_hex(),
            "unfreeze_balance": amount_sun,
            "resource": resource.as_str(),
        });
        self.submit(gateway, key, request(ContractType::UnfreezeBalanceV2, owner, body))
            .await
    }

    /// Withdraw unstaked funds whose waiting period has elapsed.
    pub async fn withdraw_unfrozen(
        &self,
        gateway: &str,
        key: &SigningKey,
    ) -> TronResult<BroadcastReceipt> {
        let owner = key.tron_address();
        let body = json!({ "owner_address": owner.to_hex() });
        self.submit(gateway, key, request(ContractType::WithdrawExpireUnfreeze, owner, body))
            .await
    }

    /// Claim accumulated voting rewards.
    pub async fn claim_reward(&self, gateway: &str, key: &SigningKey) -> TronResult<BroadcastReceipt> {
        let owner = key.tron_address();
        let body = json!({ "owner_address": owner.to_hex() });
        self.submit(gateway, key, request(ContractType::WithdrawBalance, owner, body))
            .await
    }

    /// Replace the account's votes.
    pub async fn vote(
        &self,
        gateway: &str,
        key: &SigningKey,
        votes: &[VoteItem],
    ) -> TronResult<BroadcastReceipt> {
        let votes: Vec<&VoteItem> = votes.iter().filter(|v| v.count > 0).collect();
        if votes.is_empty() {
            return Err(TronError::InvalidInput("no votes to cast".into()));
        }
        let owner = key.tron_address();
        let body = json!({
            "owner_address": owner.to_hex(),
            "votes": votes
                .iter()
                .map(|v| json!({ "vote_address": v.address.to_hex(), "vote_count": v.count }))
                .collect::<Vec<_>>(),
        });
        self.submit(gateway, key, request(ContractType::VoteWitness, owner, body))
            .await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get_account(&self, gateway: &str, address: &TronAddress) -> TronResult<AccountInfo> {
        let value = self
            .call(gateway, "/wallet/getaccount", json!({ "address": address.to_hex() }))
            .await?;
        let raw: RawAccount = serde_json::from_value(value)
            .map_err(|e| TronError::Protocol(format!("getaccount: {}", e)))?;

        Ok(AccountInfo {
            balance: raw.balance,
            votes: raw
                .votes
                .into_iter()
                .filter_map(|v| {
                    TronAddress::parse(&v.vote_address).map(|address| VoteItem {
                        address,
                        count: v.vote_count,
                    })
                })
                .collect(),
            active_permission: raw.active_permission,
        })
    }

    pub async fn get_account_resource(
        &self,
        gateway: &str,
        address: &TronAddress,
    ) -> TronResult<AccountResource> {
        let value = self
            .call(gateway, "/wallet/getaccountresource", json!({ "address": address.to_hex() }))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| TronError::Protocol(format!("getaccountresource: {}", e)))
    }

    /// Unclaimed voting reward in sun.
    pub async fn get_reward(&self, gateway: &str, address: &TronAddress) -> TronResult<u64> {
        let value = self
            .call(gateway, "/wallet/getReward", json!({ "address": address.to_hex() }))
            .await?;
        Ok(value.get("reward").and_then(Value::as_u64).unwrap_or(0))
    }

    /// TRC-20 `balanceOf` through a read-only constant call.
    pub async fn get_token_balance(
        &self,
        gateway: &str,
        token: &str,
        owner: &TronAddress,
    ) -> TronResult<U256> {
        let token = parse_address(token)?;
        let body = json!({
            "owner_address": owner.to_hex(),
            "contract_address": token.to_hex(),
            "function_selector": "balanceOf(address)",
            "parameter": alloy::primitives::hex::encode(owner.to_evm().abi_encode()),
        });
        let value = self
            .call(gateway, "/wallet/triggerconstantcontract", body)
            .await?;
        if value.pointer("/result/result").and_then(Value::as_bool) != Some(true) {
            let message = normalize::node_error_text(&value)
                .unwrap_or_else(|| "constant call was not accepted".to_string());
            return Err(TronError::Node(message));
        }

        let output = value
            .pointer("/constant_result/0")
            .and_then(Value::as_str)
            .ok_or_else(|| TronError::Protocol("balanceOf returned no constant_result".into()))?;
        let bytes = alloy::primitives::hex::decode(output)
            .map_err(|e| TronError::Protocol(format!("balanceOf: {}", e)))?;
        U256::abi_decode(&bytes).map_err(|e| TronError::Protocol(format!("balanceOf: {}", e)))
    }

    /// Unstaked sun withdrawable at `timestamp_ms`.
    pub async fn get_withdrawable_unfrozen(
        &self,
        gateway: &str,
        address: &TronAddress,
        timestamp_ms: u64,
    ) -> TronResult<u64> {
        let value = self
            .call(
                gateway,
                "/wallet/getcanwithdrawunfreezeamount",
                json!({ "owner_address": address.to_hex(), "timestamp": timestamp_ms }),
            )
            .await?;
        Ok(value.get("amount").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Whether the gateway answers with a current block.
    pub async fn is_healthy(&self, gateway: &str) -> bool {
        match self.call(gateway, "/wallet/getnowblock", json!({})).await {
            Ok(value) => value.get("block_header").is_some(),
            Err(err) => {
                tracing::warn!(gateway, error = %err, "Gateway health check failed");
                false
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAccount {
    balance: u64,
    votes: Vec<RawVote>,
    active_permission: Vec<Permission>,
}

#[derive(Debug, Deserialize)]
struct RawVote {
    vote_address: String,
    #[serde(default)]
    vote_count: u64,
}

fn request(contract: ContractType, owner: TronAddress, body: Value) -> BuildRequest {
    BuildRequest {
        contract,
        owner,
        body,
    }
}

fn parse_address(value: &str) -> TronResult<TronAddress> {
    TronAddress::parse(value)
        .ok_or_else(|| TronError::InvalidInput(format!("invalid TRON address: {}", value)))
}

fn parse_tx_id(tx_id: &str) -> TronResult<B256> {
    let bytes = alloy::primitives::hex::decode(tx_id)
        .map_err(|e| TronError::Protocol(format!("txID is not hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(TronError::Protocol(format!("txID has {} bytes", bytes.len())));
    }
    Ok(B256::from_slice(&bytes))
}

/// Check the node built what was asked before anything gets signed.
fn verify_built(tx: &UnsignedTransaction, request: &BuildRequest) -> TronResult<()> {
    let tx_id = parse_tx_id(tx.tx_id()?)?;

    let raw_hex = tx
        .raw_data_hex()
        .ok_or_else(|| TronError::Protocol("transaction is missing raw_data_hex".into()))?;
    let raw = alloy::primitives::hex::decode(raw_hex)
        .map_err(|e| TronError::Protocol(format!("raw_data_hex is not hex: {}", e)))?;
    if B256::from_slice(&Sha256::digest(&raw)) != tx_id {
        return Err(TronError::Protocol("txID does not match raw_data_hex".into()));
    }

    match tx.contract_name() {
        Some(name) if name == request.contract.name() => {}
        other => {
            return Err(TronError::Protocol(format!(
                "expected {}, gateway built {}",
                request.contract.name(),
                other.unwrap_or("nothing")
            )))
        }
    }

    let owner = tx
        .as_json()
        .pointer("/raw_data/contract/0/parameter/value/owner_address")
        .and_then(Value::as_str)
        .and_then(TronAddress::parse);
    if owner != Some(request.owner) {
        return Err(TronError::Protocol("built transaction has a different owner".into()));
    }
    Ok(())
}
