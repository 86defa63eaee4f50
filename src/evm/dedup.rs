//! Request collapsing in front of an EVM node.
//!
//! # Tiers
//! ```text
//! not in DEDUP_METHODS       → straight through (writes, signing)
//! in DEDUP_METHODS           → identical concurrent calls share one upstream request
//! also in CACHED_METHODS     → successful results reused for `ttl_ms`
//! ```
//!
//! Identity is `(method, params as JSON)`. Errors are shared with callers that
//! were already waiting but never cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::config::RpcCacheConfig;
use crate::evm::rpc::JsonRpcTransport;
use crate::evm::types::RpcError;
use crate::observability::metrics;

/// Read-only calls safe to share between concurrent callers.
pub const DEDUP_METHODS: &[&str] = &[
    "eth_chainId",
    "net_version",
    "eth_blockNumber",
    "eth_gasPrice",
    "eth_maxPriorityFeePerGas",
    "eth_feeHistory",
    "eth_getBlockByNumber",
    "eth_getBalance",
    "eth_getCode",
    "eth_call",
    "eth_estimateGas",
    "eth_getTransactionCount",
    "eth_getTransactionReceipt",
];

/// Slow-moving values worth caching for a short while.
pub const CACHED_METHODS: &[&str] = &[
    "eth_chainId",
    "net_version",
    "eth_blockNumber",
    "eth_gasPrice",
    "eth_maxPriorityFeePerGas",
    "eth_feeHistory",
    "eth_getBlockByNumber",
];

type RequestKey = (String, String);
type Flight = Arc<OnceCell<Result<Value, RpcError>>>;

struct CachedValue {
    stored_at: Instant,
    value: Value,
}

pub struct DeduplicatingRpcProvider<R> {
    inner: R,
    ttl: Duration,
    max_entries: usize,
    // Neither lock is held across an await.
    in_flight: Mutex<HashMap<RequestKey, Flight>>,
    cache: Mutex<HashMap<RequestKey, CachedValue>>,
}

impl<R: JsonRpcTransport> DeduplicatingRpcProvider<R> {
    pub fn new(inner: R, config: &RpcCacheConfig) -> Self {
        Self {
            inner,
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries,
            in_flight: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Number of cached results, expired ones included until touched.
    pub fn cached_len(&self) -> usize {
        lock(&self.cache).len()
    }

    fn cached(&self, key: &RequestKey) -> Option<Value> {
        let mut cache = lock(&self.cache);
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: RequestKey, value: Value) {
        let mut cache = lock(&self.cache);
        if cache.len() >= self.max_entries && !cache.contains_key(&key) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CachedValue {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    /// Join the in-flight request for `key` or register a new one.
    fn join(&self, key: &RequestKey) -> (Flight, bool) {
        let mut in_flight = lock(&self.in_flight);
        match in_flight.get(key) {
            Some(flight) => (Arc::clone(flight), false),
            None => {
                let flight: Flight = Arc::new(OnceCell::new());
                in_flight.insert(key.clone(), Arc::clone(&flight));
                (flight, true)
            }
        }
    }

    fn leave(&self, key: &RequestKey, flight: &Flight) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            in_flight.remove(key);
        }
    }
}

#[async_trait]
impl<R: JsonRpcTransport> JsonRpcTransport for DeduplicatingRpcProvider<R> {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if !DEDUP_METHODS.contains(&method) {
            return self.inner.request(method, params).await;
        }

        let key: RequestKey = (method.to_string(), params.to_string());
        let cacheable = CACHED_METHODS.contains(&method);

        if cacheable {
            if let Some(value) = self.cached(&key) {
                metrics::record_rpc_dedup(method, "cached");
                return Ok(value);
            }
        }

        let (flight, leader) = self.join(&key);
        if !leader {
            metrics::record_rpc_dedup(method, "in_flight");
            tracing::trace!(method, "Joining in-flight RPC request");
        }

        let result = flight
            .get_or_init(|| self.inner.request(method, params))
            .await
            .clone();
        self.leave(&key, &flight);

        if cacheable {
            if let Ok(value) = &result {
                self.store(key, value.clone());
            }
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
