//! Witness listing with a per-host TTL cache.
//!
//! A failed refresh serves the last good list instead of an error, so a flaky
//! gateway does not wipe the vote targets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::http::HttpTransport;
use crate::tron::address::TronAddress;
use crate::tron::client::ProtocolClient;
use crate::tron::types::{TronError, TronResult};

/// A block-producer candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub address: TronAddress,
    pub vote_count: u64,
    pub url: String,
    pub is_jobs: bool,
}

#[derive(Debug, Deserialize)]
struct RawWitness {
    address: String,
    #[serde(default, rename = "voteCount")]
    vote_count: u64,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "isJobs")]
    is_jobs: bool,
}

#[derive(Debug, Clone)]
struct CachedList {
    fetched_at: Instant,
    witnesses: Arc<Vec<Witness>>,
}

/// Witness lists keyed by gateway host.
#[derive(Debug)]
pub struct WitnessCache {
    ttl: Duration,
    entries: DashMap<String, CachedList>,
}

impl WitnessCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: DashMap::new(),
        }
    }

    /// The cached list if it is younger than the TTL.
    pub fn fresh(&self, host: &str) -> Option<Arc<Vec<Witness>>> {
        self.entries
            .get(host)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.witnesses))
    }

    /// The cached list regardless of age.
    pub fn stale(&self, host: &str) -> Option<Arc<Vec<Witness>>> {
        self.entries.get(host).map(|entry| Arc::clone(&entry.witnesses))
    }

    pub fn store(&self, host: &str, witnesses: Vec<Witness>) -> Arc<Vec<Witness>> {
        let witnesses = Arc::new(witnesses);
        self.entries.insert(
            host.to_string(),
            CachedList {
                fetched_at: Instant::now(),
                witnesses: Arc::clone(&witnesses),
            },
        );
        witnesses
    }
}

fn host_key(gateway: &str) -> String {
    url::Url::parse(gateway)
        .ok()
        .and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| gateway.to_string())
}

impl<T: HttpTransport> ProtocolClient<T> {
    /// Witnesses known to `gateway`, cached per host.
    pub async fn get_node_witnesses(&self, gateway: &str) -> TronResult<Arc<Vec<Witness>>> {
        let host = host_key(gateway);
        if let Some(witnesses) = self.witnesses.fresh(&host) {
            return Ok(witnesses);
        }

        match self.fetch_witnesses(gateway).await {
            Ok(list) => {
                tracing::debug!(host = %host, count = list.len(), "Witness list refreshed");
                Ok(self.witnesses.store(&host, list))
            }
            Err(err) => match self.witnesses.stale(&host) {
                Some(previous) => {
                    tracing::warn!(
                        host = %host,
                        error = %err,
                        "Witness refresh failed, serving previous list"
                    );
                    Ok(previous)
                }
                None => Err(err),
            },
        }
    }

    async fn fetch_witnesses(&self, gateway: &str) -> TronResult<Vec<Witness>> {
        let value = self.call(gateway, "/wallet/listwitnesses", json!({})).await?;
        let raw: Vec<RawWitness> = value
            .get("witnesses")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| TronError::Protocol(format!("listwitnesses: {}", e)))?
            .unwrap_or_default();

        let witnesses: Vec<Witness> = raw
            .into_iter()
            .filter_map(|w| {
                TronAddress::parse(&w.address).map(|address| Witness {
                    address,
                    vote_count: w.vote_count,
                    url: w.url,
                    is_jobs: w.is_jobs,
                })
            })
            .collect();

        if witnesses.is_empty() {
            return Err(TronError::Protocol("gateway returned no witnesses".into()));
        }
        Ok(witnesses)
    }
}

/// Whether `address` is among `witnesses`.
pub fn contains(witnesses: &[Witness], address: &TronAddress) -> bool {
    witnesses.iter().any(|w| &w.address == address)
}
