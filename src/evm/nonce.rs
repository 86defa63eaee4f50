//! Optimistic nonce allocation per (address, chain).
//!
//! The first `next` fetches the pending transaction count; later calls hand
//! out `last + 1` without a round trip. Each counter sits behind its own async
//! mutex, so concurrent sends from one account get distinct, increasing
//! nonces. Rejections that point at a stale counter reset it to "unknown".

use std::sync::Arc;

use alloy::primitives::Address;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::evm::rpc::{JsonRpcTransport, RpcExt};
use crate::evm::types::RpcError;
use crate::observability::metrics;

/// What a send rejection means for the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceFailure {
    /// The counter is stale and has been reset.
    Reset,
    /// The node already has this exact transaction; treat as sent.
    InMempool,
    /// Not a nonce problem.
    Unrelated,
}

/// Classify a send rejection message.
pub fn classify_failure(message: &str) -> NonceFailure {
    let lower = message.to_ascii_lowercase();
    if lower.contains("already known") {
        return NonceFailure::InMempool;
    }
    const STALE: &[&str] = &[
        "nonce too low",
        "nonce too high",
        "invalid nonce",
        "replacement transaction underpriced",
        "already used",
    ];
    if STALE.iter().any(|p| lower.contains(p)) {
        NonceFailure::Reset
    } else {
        NonceFailure::Unrelated
    }
}

type Counter = Arc<Mutex<Option<u64>>>;

#[derive(Debug, Clone, Default)]
pub struct NonceQueue {
    counters: Arc<DashMap<(Address, u64), Counter>>,
}

impl NonceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, address: Address, chain_id: u64) -> Counter {
        // Clone the Arc out so the shard lock is not held across an await.
        let entry = self
            .counters
            .entry((address, chain_id))
            .or_insert_with(|| Arc::new(Mutex::new(None)));
        Arc::clone(entry.value())
    }

    /// Allocate the next nonce for `address` on `chain_id`.
    pub async fn next<R>(&self, rpc: &R, address: Address, chain_id: u64) -> Result<u64, RpcError>
    where
        R: JsonRpcTransport + ?Sized,
    {
        let counter = self.counter(address, chain_id);
        let mut last = counter.lock().await;

        let nonce = match *last {
            Some(previous) => previous + 1,
            None => {
                let pending = rpc.pending_nonce(address).await?;
                tracing::debug!(%address, chain_id, nonce = pending, "Nonce fetched from node");
                pending
            }
        };
        *last = Some(nonce);
        tracing::debug!(%address, chain_id, nonce, "Nonce allocated");
        Ok(nonce)
    }

    /// Last allocated nonce, if known.
    pub async fn peek(&self, address: Address, chain_id: u64) -> Option<u64> {
        let counter = self.counters.get(&(address, chain_id)).map(|r| Arc::clone(r.value()))?;
        let last = counter.lock().await;
        *last
    }

    /// Forget the counter; the next allocation asks the node again.
    pub async fn invalidate(&self, address: Address, chain_id: u64) {
        let counter = self.counters.get(&(address, chain_id)).map(|r| Arc::clone(r.value()));
        if let Some(counter) = counter {
            *counter.lock().await = None;
            metrics::record_nonce_reset(chain_id);
            tracing::debug!(%address, chain_id, "Nonce counter reset");
        }
    }

    /// Inspect a send rejection and reset the counter when it is stale.
    pub async fn observe_failure(&self, address: Address, chain_id: u64, message: &str) -> NonceFailure {
        let failure = classify_failure(message);
        if failure == NonceFailure::Reset {
            tracing::warn!(%address, chain_id, error = message, "Nonce rejected, resetting counter");
            self.invalidate(address, chain_id).await;
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Reports a pending count that can be changed between calls.
    struct Node {
        pending: AtomicU64,
        calls: AtomicUsize,
    }

    impl Node {
        fn new(pending: u64) -> Self {
            Self {
                pending: AtomicU64::new(pending),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JsonRpcTransport for Node {
        async fn request(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            assert_eq!(method, "eth_getTransactionCount");
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(json!(format!("0x{:x}", self.pending.load(Ordering::SeqCst))))
        }
    }

    const ALICE: Address = address!("00000000000000000000000000000000000000a1");

    #[tokio::test]
    async fn test_monotonic_without_round_trips() {
        let node = Node::new(7);
        let queue = NonceQueue::new();
        let nonces = [
            queue.next(&node, ALICE, 1).await.unwrap(),
            queue.next(&node, ALICE, 1).await.unwrap(),
            queue.next(&node, ALICE, 1).await.unwrap(),
        ];
        assert_eq!(nonces, [7, 8, 9]);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let node = Arc::new(Node::new(0));
        let queue = NonceQueue::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let node = Arc::clone(&node);
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.next(node.as_ref(), ALICE, 1).await.unwrap()
            }));
        }
        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..10).collect::<Vec<_>>());
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resets_to_node_value() {
        let node = Node::new(3);
        let queue = NonceQueue::new();
        queue.next(&node, ALICE, 1).await.unwrap();
        queue.next(&node, ALICE, 1).await.unwrap();

        node.pending.store(12, Ordering::SeqCst);
        let failure = queue
            .observe_failure(ALICE, 1, "nonce too low: next nonce 12, tx nonce 4")
            .await;
        assert_eq!(failure, NonceFailure::Reset);
        assert_eq!(queue.peek(ALICE, 1).await, None);
        assert_eq!(queue.next(&node, ALICE, 1).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_chains_are_independent() {
        let node = Node::new(5);
        let queue = NonceQueue::new();
        assert_eq!(queue.next(&node, ALICE, 1).await.unwrap(), 5);
        assert_eq!(queue.next(&node, ALICE, 137).await.unwrap(), 5);
        queue.invalidate(ALICE, 1).await;
        assert_eq!(queue.peek(ALICE, 137).await, Some(5));
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("already known"), NonceFailure::InMempool);
        assert_eq!(
            classify_failure("replacement transaction underpriced"),
            NonceFailure::Reset
        );
        assert_eq!(classify_failure("Invalid nonce"), NonceFailure::Reset);
        assert_eq!(classify_failure("nonce has already used"), NonceFailure::Reset);
        assert_eq!(classify_failure("insufficient funds"), NonceFailure::Unrelated);
    }
}
