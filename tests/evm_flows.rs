//! EVM sending, Safe multisig and request collapsing against in-memory nodes.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::consensus::{TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{address, hex, keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use serde_json::{json, Value};

use common::{key, node_error, ScriptedNode, KEY_0, KEY_1, KEY_2};
use wallet_engine::evm::safe::{ISafe, SENTINEL_OWNERS};
use wallet_engine::evm::{
    DeduplicatingRpcProvider, EvmSender, JsonRpcTransport, NonceQueue, Proposal, RpcError, RpcExt,
    SafeOrchestrator, SafeQueue, SafeTxPhase,
};
use wallet_engine::evm::types::EvmError;
use wallet_engine::records::ConfirmationOutcome;
use wallet_engine::router::AccountKind;
use wallet_engine::{
    ChainTarget, EngineConfig, RouteOutcome, SendIntent, TransactionLog, TransactionRouter, TxStatus,
};

const SAFE: Address = address!("00000000000000000000000000000000000005af");
const BOB: Address = address!("00000000000000000000000000000000000000b0");
/// Not an owner of [`SAFE`].
const KEY_3: &str = "7c852118294e51e653712a81e05800f419141751be58f605c371e15141b007a6";

/// Chain 1 with one Safe owned by the first three development keys.
///
/// The account nonce only moves forward on accepted broadcasts, or when a
/// test bumps it to simulate another client using the same account.
struct Chain {
    pending: AtomicU64,
    owners: Vec<Address>,
    threshold: u64,
    safe_nonce: u64,
    sent: Mutex<Vec<TxLegacy>>,
    nonce_queries: AtomicU64,
}

impl Chain {
    fn new(pending: u64) -> Self {
        Self {
            pending: AtomicU64::new(pending),
            owners: vec![key(KEY_0).evm_address(), key(KEY_1).evm_address(), key(KEY_2).evm_address()],
            threshold: 2,
            safe_nonce: 5,
            sent: Mutex::new(Vec::new()),
            nonce_queries: AtomicU64::new(0),
        }
    }

    fn sent(&self) -> Vec<TxLegacy> {
        self.sent.lock().unwrap().clone()
    }

    fn eth_call(&self, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let selector: [u8; 4] = data[..4].try_into().unwrap();
        if selector == ISafe::nonceCall::SELECTOR {
            Ok(U256::from(self.safe_nonce).abi_encode())
        } else if selector == ISafe::getOwnersCall::SELECTOR {
            Ok(self.owners.abi_encode())
        } else if selector == ISafe::getThresholdCall::SELECTOR {
            Ok(U256::from(self.threshold).abi_encode())
        } else if selector == ISafe::getTransactionHashCall::SELECTOR {
            ISafe::getTransactionHashCall::abi_decode(data)
                .map_err(|e| RpcError::Malformed(e.to_string()))?;
            Ok(keccak256(data).abi_encode())
        } else {
            Err(node_error(3, "execution reverted"))
        }
    }

    fn broadcast(&self, raw: &str) -> Result<Value, RpcError> {
        let raw = hex::decode(raw).unwrap();
        let envelope = TxEnvelope::decode_2718(&mut &raw[..]).unwrap();
        let hash = *envelope.tx_hash();
        let tx = envelope.as_legacy().unwrap().tx().clone();

        let expected = self.pending.load(Ordering::SeqCst);
        if tx.nonce < expected {
            return Err(node_error(-32000, "nonce too low"));
        }
        self.pending.store(tx.nonce + 1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(tx);
        Ok(json!(hash))
    }
}

#[async_trait]
impl JsonRpcTransport for Chain {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "eth_chainId" => Ok(json!("0x1")),
            "eth_gasPrice" => Ok(json!("0x2540be400")),
            "eth_estimateGas" => Ok(json!("0x186a0")),
            "eth_getTransactionCount" => {
                self.nonce_queries.fetch_add(1, Ordering::SeqCst);
                Ok(json!(format!("0x{:x}", self.pending.load(Ordering::SeqCst))))
            }
            "eth_call" => {
                let data = hex::decode(params[0]["data"].as_str().unwrap()).unwrap();
                Ok(json!(hex::encode_prefixed(self.eth_call(&data)?)))
            }
            "eth_sendRawTransaction" => self.broadcast(params[0].as_str().unwrap()),
            "eth_getTransactionReceipt" => Ok(json!({"status": "0x1", "blockNumber": "0x10"})),
            other => Err(RpcError::Malformed(format!("unexpected {}", other))),
        }
    }
}

fn sender(chain: Chain) -> EvmSender<Chain> {
    EvmSender::new(Arc::new(chain), NonceQueue::new(), &EngineConfig::default())
}

fn orchestrator(chain: Chain, log: TransactionLog) -> SafeOrchestrator<Chain> {
    SafeOrchestrator::new(sender(chain), SafeQueue::new(), log)
}

#[tokio::test]
async fn test_nonces_are_consecutive_then_resync_after_reset() {
    let sender = sender(Chain::new(7));
    let alice = key(KEY_0);

    sender.send_native(&alice, BOB, U256::from(1)).await.unwrap();
    sender.send_native(&alice, BOB, U256::from(2)).await.unwrap();
    assert_eq!(sender.rpc().nonce_queries.load(Ordering::SeqCst), 1);

    // Another client spends nonces 9..=11 behind our back.
    sender.rpc().pending.store(12, Ordering::SeqCst);
    let err = sender.send_native(&alice, BOB, U256::from(3)).await.unwrap_err();
    assert!(matches!(err, EvmError::Nonce(_)));

    sender.send_native(&alice, BOB, U256::from(3)).await.unwrap();
    let nonces: Vec<u64> = sender.rpc().sent().iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, vec![7, 8, 12]);

    let first = &sender.rpc().sent()[0];
    assert_eq!(first.chain_id, Some(1));
    // 10 gwei × 1.2
    assert_eq!(first.gas_price, 12_000_000_000);
    // 100_000 × 1.2
    assert_eq!(first.gas_limit, 120_000);
}

#[tokio::test]
async fn test_safe_waits_for_threshold_and_sorts_signatures() {
    let log = TransactionLog::new();
    let safe = orchestrator(Chain::new(0), log.clone());
    let (owner_a, owner_c) = (key(KEY_2), key(KEY_0));

    let proposal = safe
        .propose(&owner_a, SAFE, BOB, U256::from(1_000), Bytes::new(), "pay bob")
        .await
        .unwrap();
    let Proposal::Queued { safe_tx_hash, have, need } = proposal else {
        panic!("expected a queued proposal, got {:?}", proposal);
    };
    assert_eq!((have, need), (1, 2));
    assert!(safe.sender().rpc().sent().is_empty());

    let queued = safe.queue().get(&safe_tx_hash).unwrap();
    assert_eq!(queued.nonce, U256::from(5));
    assert_eq!(queued.phase, SafeTxPhase::Signing);
    let record = log.get(&queued.record_id.unwrap()).unwrap();
    assert_eq!(record.status, TxStatus::Queued);

    let err = safe.execute(&owner_a, &safe_tx_hash).await.unwrap_err();
    assert!(matches!(err, EvmError::BelowThreshold { have: 1, threshold: 2 }));

    assert_eq!(safe.add_signature(&owner_c, &safe_tx_hash).await.unwrap(), 2);
    // Signing twice does not count twice.
    assert_eq!(safe.add_signature(&owner_c, &safe_tx_hash).await.unwrap(), 2);

    let mut execution = safe.execute(&owner_c, &safe_tx_hash).await.unwrap();
    assert_eq!(execution.phase, SafeTxPhase::Submitted);
    assert!(safe.queue().is_empty());

    let sent = safe.sender().rpc().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to.to(), Some(&SAFE));
    let call = ISafe::execTransactionCall::abi_decode(&sent[0].input).unwrap();
    assert_eq!(call.to, BOB);
    assert_eq!(call.value, U256::from(1_000));

    // 0x3C44… (KEY_2) sorts before 0xf39F… (KEY_0).
    let signatures = call.signatures;
    assert_eq!(signatures.len(), 130);
    assert_eq!(&signatures[..65], &safe.sign(&owner_a, &safe_tx_hash).unwrap()[..]);
    assert_eq!(&signatures[65..], &safe.sign(&owner_c, &safe_tx_hash).unwrap()[..]);
    assert!(signatures[64] > 30 && signatures[129] > 30);

    let outcome = safe.confirm_execution(&mut execution).await;
    assert_eq!(outcome, ConfirmationOutcome::Confirmed { block_number: Some(16) });
    assert_eq!(execution.phase, SafeTxPhase::Confirmed);
    let record = log.get(&execution.record_id).unwrap();
    assert_eq!(record.status, TxStatus::Confirmed);
    assert_eq!(record.hash, Some(execution.tx_hash.to_string()));
}

#[tokio::test]
async fn test_single_owner_threshold_executes_on_proposal() {
    let mut chain = Chain::new(0);
    chain.threshold = 1;
    let safe = orchestrator(chain, TransactionLog::new());

    let proposal = safe
        .propose(&key(KEY_1), SAFE, BOB, U256::from(7), Bytes::new(), "pay bob")
        .await
        .unwrap();
    assert!(matches!(proposal, Proposal::Executed(_)));
    assert!(safe.queue().is_empty());
    assert_eq!(safe.sender().rpc().sent().len(), 1);
}

#[tokio::test]
async fn test_non_owner_cannot_propose_or_sign() {
    let safe = orchestrator(Chain::new(0), TransactionLog::new());
    let outsider = key(KEY_3);

    let err = safe
        .propose(&outsider, SAFE, BOB, U256::from(1), Bytes::new(), "pay bob")
        .await
        .unwrap_err();
    assert!(matches!(err, EvmError::NotOwner(a) if a == outsider.evm_address()));

    let Proposal::Queued { safe_tx_hash, .. } = safe
        .propose(&key(KEY_0), SAFE, BOB, U256::from(1), Bytes::new(), "pay bob")
        .await
        .unwrap()
    else {
        panic!("expected a queued proposal");
    };
    let err = safe.add_signature(&outsider, &safe_tx_hash).await.unwrap_err();
    assert!(matches!(err, EvmError::NotOwner(_)));

    let err = safe.execute(&outsider, &B256::ZERO).await.unwrap_err();
    assert!(matches!(err, EvmError::UnknownSafeTx(_)));
}

#[tokio::test]
async fn test_remove_first_owner_is_a_queued_self_call() {
    let mut chain = Chain::new(0);
    chain.threshold = 3;
    let safe = orchestrator(chain, TransactionLog::new());
    let first_owner = key(KEY_0).evm_address();

    let proposal = safe.remove_owner(&key(KEY_1), SAFE, first_owner).await.unwrap();
    let Proposal::Queued { safe_tx_hash, have, need } = proposal else {
        panic!("expected a queued proposal, got {:?}", proposal);
    };
    assert_eq!((have, need), (1, 3));

    let queued = safe.queue().get(&safe_tx_hash).unwrap();
    assert_eq!(queued.to, SAFE);
    assert_eq!(queued.value, U256::ZERO);
    let call = ISafe::removeOwnerCall::abi_decode(&queued.data).unwrap();
    assert_eq!(call.prevOwner, SENTINEL_OWNERS);
    assert_eq!(call.owner, first_owner);
    // Three owners at threshold 3 leave two owners at threshold 2.
    assert_eq!(call._threshold, U256::from(2));
}

#[tokio::test]
async fn test_owner_changes_execute_against_the_safe_itself() {
    let mut chain = Chain::new(0);
    chain.threshold = 1;
    let safe = orchestrator(chain, TransactionLog::new());
    let admin = key(KEY_0);
    let middle_owner = key(KEY_1).evm_address();

    let removed = safe.remove_owner(&admin, SAFE, middle_owner).await.unwrap();
    assert!(matches!(removed, Proposal::Executed(_)));
    let added = safe.add_owner(&admin, SAFE, BOB, None).await.unwrap();
    assert!(matches!(added, Proposal::Executed(_)));
    let changed = safe.change_threshold(&admin, SAFE, 2).await.unwrap();
    assert!(matches!(changed, Proposal::Executed(_)));

    let sent = safe.sender().rpc().sent();
    assert_eq!(sent.len(), 3);
    let calls: Vec<_> = sent
        .iter()
        .map(|tx| {
            assert_eq!(tx.to.to(), Some(&SAFE));
            ISafe::execTransactionCall::abi_decode(&tx.input).unwrap()
        })
        .collect();
    assert!(calls.iter().all(|call| call.to == SAFE && call.value.is_zero()));

    let remove = ISafe::removeOwnerCall::abi_decode(&calls[0].data).unwrap();
    assert_eq!(remove.prevOwner, key(KEY_0).evm_address());
    assert_eq!(remove.owner, middle_owner);
    assert_eq!(remove._threshold, U256::from(1));

    let add = ISafe::addOwnerWithThresholdCall::abi_decode(&calls[1].data).unwrap();
    assert_eq!(add.owner, BOB);
    assert_eq!(add._threshold, U256::from(1));

    let change = ISafe::changeThresholdCall::abi_decode(&calls[2].data).unwrap();
    assert_eq!(change._threshold, U256::from(2));
}

#[tokio::test]
async fn test_invalid_owner_changes_are_rejected_before_proposal() {
    let safe = orchestrator(Chain::new(0), TransactionLog::new());
    let admin = key(KEY_0);

    let err = safe.change_threshold(&admin, SAFE, 4).await.unwrap_err();
    assert!(matches!(err, EvmError::InvalidInput(_)));
    let err = safe
        .add_owner(&admin, SAFE, key(KEY_2).evm_address(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EvmError::InvalidInput(_)));
    let err = safe.remove_owner(&admin, SAFE, BOB).await.unwrap_err();
    assert!(matches!(err, EvmError::InvalidInput(_)));
    assert!(safe.queue().is_empty());
}

#[tokio::test]
async fn test_router_queues_safe_transfer() {
    let log = TransactionLog::new();
    let router: TransactionRouter<common::ScriptedGateway, Chain> =
        TransactionRouter::new(key(KEY_0), log.clone()).with_evm(sender(Chain::new(0)), SafeQueue::new());

    let intent = SendIntent {
        chain: ChainTarget::Evm { chain_id: 1 },
        account: AccountKind::Safe { address: SAFE },
        to: BOB.to_string(),
        amount: U256::from(5),
        token: None,
        summary: Some("rent".into()),
    };
    let outcome = router.send(&intent).await.unwrap();
    assert!(matches!(outcome, RouteOutcome::AwaitingSignatures { have: 1, need: 2, .. }));

    let records = log.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TxStatus::Queued);
    assert_eq!(records[0].summary, "rent");
}

#[tokio::test]
async fn test_identical_reads_share_one_upstream_call() {
    let node = ScriptedNode::new(|method, _| match method {
        "eth_getBalance" => Ok(json!("0xde0b6b3a7640000")),
        "eth_chainId" => Ok(json!("0x1")),
        "eth_sendRawTransaction" => Ok(json!(format!("0x{}", "ab".repeat(32)))),
        other => Err(RpcError::Malformed(other.to_string())),
    })
    .with_delay(Duration::from_millis(50));
    let provider = Arc::new(DeduplicatingRpcProvider::new(node, &EngineConfig::default().rpc_cache));

    let balances = futures_util::future::join_all(
        (0..5).map(|_| {
            let provider = Arc::clone(&provider);
            async move { provider.balance(BOB).await }
        }),
    )
    .await;
    for balance in balances {
        assert_eq!(balance.unwrap(), U256::from(1_000_000_000_000_000_000u64));
    }
    assert_eq!(provider.inner().count("eth_getBalance"), 1);

    // Cached for the TTL once resolved.
    assert_eq!(provider.chain_id().await.unwrap(), 1);
    assert_eq!(provider.chain_id().await.unwrap(), 1);
    assert_eq!(provider.inner().count("eth_chainId"), 1);

    // Writes always reach the node.
    let (a, b) = tokio::join!(
        provider.send_raw_transaction(&[0x01]),
        provider.send_raw_transaction(&[0x01])
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(provider.inner().count("eth_sendRawTransaction"), 2);
}
