//! Transaction building, signing, broadcasting and receipt polling for EOAs.
//!
//! # Responsibilities
//! - Price gas against the configured ceiling
//! - Allocate nonces through the shared [`NonceQueue`]
//! - Sign legacy EIP-155 transactions locally and broadcast the raw bytes
//! - Poll receipts until a verdict or a soft timeout

use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use serde_json::Value;
use tokio::time::{interval, timeout};

use crate::config::{EngineConfig, EvmConfig, PollingConfig};
use crate::errors::{Classify, ErrorKind};
use crate::evm::erc20;
use crate::evm::nonce::{NonceFailure, NonceQueue};
use crate::evm::rpc::{parse_u64, JsonRpcTransport, RpcExt};
use crate::evm::safe::explain_revert;
use crate::evm::types::{EvmError, EvmResult, RpcError};
use crate::observability::metrics;
use crate::records::ConfirmationOutcome;
use crate::wallet::SigningKey;

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Signs and broadcasts transactions for a single chain.
pub struct EvmSender<R> {
    rpc: Arc<R>,
    nonces: NonceQueue,
    config: EvmConfig,
    polling: PollingConfig,
}

impl<R> Clone for EvmSender<R> {
    fn clone(&self) -> Self {
        Self {
            rpc: Arc::clone(&self.rpc),
            nonces: self.nonces.clone(),
            config: self.config.clone(),
            polling: self.polling.clone(),
        }
    }
}

impl<R: JsonRpcTransport> EvmSender<R> {
    /// Create a sender. Pass the same `nonces` to every sender that signs for
    /// the same accounts.
    pub fn new(rpc: Arc<R>, nonces: NonceQueue, config: &EngineConfig) -> Self {
        Self {
            rpc,
            nonces,
            config: config.evm.clone(),
            polling: config.polling.clone(),
        }
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn nonces(&self) -> &NonceQueue {
        &self.nonces
    }

    /// Verify the node serves the configured chain.
    pub async fn verify_chain_id(&self) -> EvmResult<()> {
        let actual = self.rpc.chain_id().await?;
        if actual != self.config.chain_id {
            return Err(EvmError::ChainMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }
        Ok(())
    }

    /// Node gas price with the safety multiplier applied, capped at the ceiling.
    pub async fn gas_price(&self) -> EvmResult<u128> {
        let gas_price = self.rpc.gas_price().await?;
        let gas_price_gwei = gas_price / WEI_PER_GWEI;

        if gas_price_gwei > self.config.max_gas_price_gwei as u128 {
            return Err(EvmError::GasPriceTooHigh {
                current_gwei: gas_price_gwei as u64,
                max_gwei: self.config.max_gas_price_gwei,
            });
        }

        let adjusted = (gas_price as f64 * self.config.gas_price_multiplier) as u128;
        let ceiling = self.config.max_gas_price_gwei as u128 * WEI_PER_GWEI;
        Ok(adjusted.min(ceiling))
    }

    async fn gas_limit(&self, from: Address, to: Address, value: U256, data: &Bytes) -> EvmResult<u64> {
        let estimate = self
            .rpc
            .estimate_gas(from, to, value, data)
            .await
            .map_err(reverted_or_rpc)?;
        Ok((estimate as f64 * self.config.gas_limit_buffer).ceil() as u64)
    }

    /// Build, sign and broadcast a call from `key`'s EVM account.
    pub async fn send_transaction(
        &self,
        key: &SigningKey,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> EvmResult<B256> {
        let from = key.evm_address();
        let chain_id = self.config.chain_id;

        let gas_price = self.gas_price().await?;
        let gas_limit = self.gas_limit(from, to, value, &data).await?;
        let nonce = self.nonces.next(self.rpc.as_ref(), from, chain_id).await?;

        let tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(to),
            value,
            input: data,
        };

        let signature = match key.sign_hash(&tx.signature_hash()) {
            Ok(signature) => signature,
            Err(err) => {
                self.nonces.invalidate(from, chain_id).await;
                return Err(err.into());
            }
        };
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        match self.rpc.send_raw_transaction(&raw).await {
            Ok(accepted) => {
                metrics::record_broadcast("evm", "accepted");
                tracing::info!(%from, %to, nonce, tx_hash = %accepted, "Transaction broadcast");
                Ok(accepted)
            }
            Err(err) => {
                let text = err.full_text();
                match self.nonces.observe_failure(from, chain_id, &text).await {
                    NonceFailure::InMempool => {
                        metrics::record_broadcast("evm", "accepted");
                        tracing::info!(%from, nonce, tx_hash = %hash, "Transaction already in mempool");
                        Ok(hash)
                    }
                    NonceFailure::Reset => {
                        metrics::record_broadcast("evm", "rejected");
                        Err(EvmError::Nonce(text))
                    }
                    NonceFailure::Unrelated => {
                        metrics::record_broadcast("evm", "rejected");
                        // The node never took this nonce; resync before the next send.
                        self.nonces.invalidate(from, chain_id).await;
                        tracing::warn!(%from, nonce, error = %text, "Broadcast rejected");
                        Err(reverted_or_rpc(err))
                    }
                }
            }
        }
    }

    /// Send native currency.
    pub async fn send_native(&self, key: &SigningKey, to: Address, amount: U256) -> EvmResult<B256> {
        if amount.is_zero() {
            return Err(EvmError::InvalidInput("amount must be positive".into()));
        }
        self.send_transaction(key, to, amount, Bytes::new()).await
    }

    /// Send an ERC-20 `transfer`.
    pub async fn send_erc20(
        &self,
        key: &SigningKey,
        token: Address,
        to: Address,
        amount: U256,
    ) -> EvmResult<B256> {
        if amount.is_zero() {
            return Err(EvmError::InvalidInput("amount must be positive".into()));
        }
        self.send_transaction(key, token, U256::ZERO, erc20::transfer_calldata(to, amount))
            .await
    }

    /// One receipt probe. `None` while the transaction is unmined.
    pub async fn check_receipt(&self, hash: B256) -> EvmResult<Option<ConfirmationOutcome>> {
        let Some(receipt) = self.rpc.transaction_receipt(hash).await? else {
            return Ok(None);
        };
        Ok(Some(outcome_from_receipt(&receipt)?))
    }

    /// Poll the receipt until a verdict or the configured timeout.
    pub async fn wait_for_receipt(&self, hash: B256) -> ConfirmationOutcome {
        let poll_interval = Duration::from_millis(self.polling.interval_ms);
        let deadline = Duration::from_secs(self.polling.confirmation_timeout_secs);

        let result = timeout(deadline, async {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                match self.check_receipt(hash).await {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => tracing::debug!(tx_hash = %hash, "Transaction pending"),
                    Err(err) => tracing::debug!(tx_hash = %hash, error = %err, "Receipt probe failed"),
                }
            }
        })
        .await;

        result.unwrap_or_else(|_| {
            tracing::warn!(tx_hash = %hash, "Receipt not observed before timeout");
            ConfirmationOutcome::Unresolved
        })
    }
}

fn outcome_from_receipt(receipt: &Value) -> EvmResult<ConfirmationOutcome> {
    let block_number = match receipt.get("blockNumber") {
        Some(Value::Null) | None => None,
        Some(n) => Some(parse_u64(n)?),
    };
    let status = receipt.get("status").map(parse_u64).transpose()?;
    Ok(match status {
        Some(0) => ConfirmationOutcome::Failed {
            reason: "Transaction reverted".to_string(),
        },
        _ => ConfirmationOutcome::Confirmed { block_number },
    })
}

/// Reverts become [`EvmError::Reverted`] with any Safe code spelled out.
fn reverted_or_rpc(err: RpcError) -> EvmError {
    if err.kind() == ErrorKind::Consensus {
        EvmError::Reverted(explain_revert(&err.full_text()))
    } else {
        EvmError::Rpc(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::{address, hex};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const BOB: Address = address!("00000000000000000000000000000000000000b0");

    /// Scripted node; broadcast replies are popped in order.
    struct Node {
        gas_price_wei: u128,
        pending: u64,
        broadcast_errors: Mutex<Vec<Option<&'static str>>>,
        sent: Mutex<Vec<Vec<u8>>>,
        receipt: Value,
    }

    impl Node {
        fn new(gas_price_gwei: u128) -> Self {
            Self {
                gas_price_wei: gas_price_gwei * WEI_PER_GWEI,
                pending: 4,
                broadcast_errors: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                receipt: Value::Null,
            }
        }
    }

    #[async_trait]
    impl JsonRpcTransport for Node {
        async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "eth_chainId" => Ok(json!("0x1")),
                "eth_gasPrice" => Ok(json!(format!("0x{:x}", self.gas_price_wei))),
                "eth_estimateGas" => Ok(json!("0x5208")),
                "eth_getTransactionCount" => Ok(json!(format!("0x{:x}", self.pending))),
                "eth_sendRawTransaction" => {
                    let raw = hex::decode(params[0].as_str().unwrap()).unwrap();
                    self.sent.lock().unwrap().push(raw);
                    let next = {
                        let mut errors = self.broadcast_errors.lock().unwrap();
                        if errors.is_empty() { None } else { errors.remove(0) }
                    };
                    match next {
                        Some(message) => Err(RpcError::Node {
                            code: -32000,
                            message: message.into(),
                            data: None,
                        }),
                        None => Ok(json!(format!("0x{}", "ab".repeat(32)))),
                    }
                }
                "eth_getTransactionReceipt" => Ok(self.receipt.clone()),
                other => Err(RpcError::Malformed(other.to_string())),
            }
        }
    }

    fn make_sender(node: Node) -> EvmSender<Node> {
        EvmSender::new(Arc::new(node), NonceQueue::new(), &EngineConfig::default())
    }

    fn key() -> SigningKey {
        SigningKey::from_hex(TEST_PRIVATE_KEY).unwrap()
    }

    fn decode_legacy(raw: &[u8]) -> TxLegacy {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..]).unwrap();
        envelope.as_legacy().unwrap().tx().clone()
    }

    #[tokio::test]
    async fn test_gas_price_ceiling() {
        let sender = make_sender(Node::new(600));
        let err = sender.gas_price().await.unwrap_err();
        assert!(matches!(
            err,
            EvmError::GasPriceTooHigh {
                current_gwei: 600,
                max_gwei: 500
            }
        ));

        // 450 gwei * 1.2 would exceed the ceiling; it is clamped instead.
        let sender = make_sender(Node::new(450));
        assert_eq!(sender.gas_price().await.unwrap(), 500 * WEI_PER_GWEI);
    }

    #[tokio::test]
    async fn test_chain_id_must_match_config() {
        assert!(make_sender(Node::new(10)).verify_chain_id().await.is_ok());

        let mut config = EngineConfig::default();
        config.evm.chain_id = 56;
        let sender = EvmSender::new(Arc::new(Node::new(10)), NonceQueue::new(), &config);
        let err = sender.verify_chain_id().await.unwrap_err();
        assert!(matches!(err, EvmError::ChainMismatch { expected: 56, actual: 1 }));
    }

    #[tokio::test]
    async fn test_sends_use_consecutive_nonces() {
        let sender = make_sender(Node::new(10));
        let key = key();
        sender.send_native(&key, BOB, U256::from(1u64)).await.unwrap();
        sender.send_native(&key, BOB, U256::from(2u64)).await.unwrap();

        let sent = sender.rpc().sent.lock().unwrap().clone();
        let first = decode_legacy(&sent[0]);
        let second = decode_legacy(&sent[1]);
        assert_eq!((first.nonce, second.nonce), (4, 5));
        assert_eq!(first.chain_id, Some(1));
        assert_eq!(first.to, TxKind::Call(BOB));
        assert_eq!(first.gas_limit, 25_200);
        assert_eq!(first.gas_price, 12 * WEI_PER_GWEI);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resets_counter() {
        let node = Node::new(10);
        node.broadcast_errors
            .lock()
            .unwrap()
            .push(Some("nonce too low"));
        let sender = make_sender(node);
        let key = key();

        let err = sender.send_native(&key, BOB, U256::from(1u64)).await.unwrap_err();
        assert!(matches!(err, EvmError::Nonce(_)));
        assert_eq!(sender.nonces().peek(key.evm_address(), 1).await, None);

        // Resynced from the node, not 5.
        sender.send_native(&key, BOB, U256::from(1u64)).await.unwrap();
        let sent = sender.rpc().sent.lock().unwrap().clone();
        assert_eq!(decode_legacy(&sent[1]).nonce, 4);
    }

    #[tokio::test]
    async fn test_already_known_is_success() {
        let node = Node::new(10);
        node.broadcast_errors
            .lock()
            .unwrap()
            .push(Some("already known"));
        let sender = make_sender(node);
        let key = key();

        let hash = sender.send_native(&key, BOB, U256::from(1u64)).await.unwrap();
        assert_ne!(hash, B256::ZERO);
        assert_eq!(sender.nonces().peek(key.evm_address(), 1).await, Some(4));
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_locally() {
        let sender = make_sender(Node::new(10));
        let err = sender.send_native(&key(), BOB, U256::ZERO).await.unwrap_err();
        assert!(matches!(err, EvmError::InvalidInput(_)));
        assert!(sender.rpc().sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_outcomes() {
        let mut node = Node::new(10);
        node.receipt = json!({"status": "0x1", "blockNumber": "0x10"});
        let sender = make_sender(node);
        assert_eq!(
            sender.check_receipt(B256::ZERO).await.unwrap(),
            Some(ConfirmationOutcome::Confirmed {
                block_number: Some(16)
            })
        );

        let mut node = Node::new(10);
        node.receipt = json!({"status": "0x0", "blockNumber": "0x10"});
        let sender = make_sender(node);
        assert!(matches!(
            sender.check_receipt(B256::ZERO).await.unwrap(),
            Some(ConfirmationOutcome::Failed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmined_receipt_times_out_unresolved() {
        let sender = make_sender(Node::new(10));
        assert_eq!(
            sender.wait_for_receipt(B256::ZERO).await,
            ConfirmationOutcome::Unresolved
        );
    }
}
