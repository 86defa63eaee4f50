//! Per-host rate limiting for the shared public gateway.
//!
//! # Algorithm
//! ```text
//! per host: (next_allowed_at, interval_ms) behind one async mutex
//!
//! lock(host)                       ← callers queue here, FIFO
//!   sleep until next_allowed_at
//!   send
//!   429 → interval = min(2×, max); retry up to max_retries, then surface
//!   ok  → interval = max(interval - step, base)
//!   next_allowed_at = now + interval
//! unlock(host)
//! ```
//!
//! The lock is held for the whole exchange, so exactly one request per host
//! is in flight. Hosts that do not match a configured gateway suffix bypass
//! the limiter entirely.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::config::RateLimitConfig;
use crate::http::transport::{HttpResponse, HttpTransport, TransportError};
use crate::observability::metrics;
use crate::resilience::backoff;

/// Limiter bookkeeping for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub next_allowed_at: Instant,
    pub interval_ms: u64,
}

/// Wraps a transport with a per-host AIMD limiter.
pub struct RateLimitedHttpClient<T> {
    inner: T,
    config: RateLimitConfig,
    limited_hosts: Vec<String>,
    hosts: DashMap<String, Arc<Mutex<RateLimitState>>>,
}

impl<T: HttpTransport> RateLimitedHttpClient<T> {
    /// `limited_hosts` are host suffixes (e.g., "trongrid.io").
    pub fn new(inner: T, config: RateLimitConfig, limited_hosts: Vec<String>) -> Self {
        Self {
            inner,
            config,
            limited_hosts,
            hosts: DashMap::new(),
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Whether requests to `host` go through the limiter.
    pub fn applies_to(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.limited_hosts.iter().any(|suffix| {
            let suffix = suffix.to_ascii_lowercase();
            host == suffix || host.ends_with(&format!(".{}", suffix))
        })
    }

    /// Current limiter state for `host`, if it has been used.
    pub async fn state(&self, host: &str) -> Option<RateLimitState> {
        let slot = self.hosts.get(host).map(|r| Arc::clone(r.value()))?;
        let state = slot.lock().await;
        Some(*state)
    }

    fn slot(&self, host: &str) -> Arc<Mutex<RateLimitState>> {
        // Clone the Arc out so the map shard is not held across an await.
        let entry = self.hosts.entry(host.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(RateLimitState {
                next_allowed_at: Instant::now(),
                interval_ms: self.config.base_interval_ms,
            }))
        });
        Arc::clone(entry.value())
    }

    /// POST through the limiter when the URL's host is a gateway host.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        let parsed = url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no host", url)))?
            .to_ascii_lowercase();

        if !self.applies_to(&host) {
            return self.inner.post_json(url, body).await;
        }

        let slot = self.slot(&host);
        let mut state = slot.lock().await;
        let mut attempt = 0u32;

        loop {
            if state.next_allowed_at > Instant::now() {
                sleep_until(state.next_allowed_at).await;
            }

            let result = self.inner.post_json(url, body).await;

            match &result {
                Err(err) if err.is_rate_limited() => {
                    state.interval_ms = backoff::back_off(state.interval_ms, &self.config);
                    state.next_allowed_at =
                        Instant::now() + backoff::as_duration(state.interval_ms);
                    metrics::record_rate_limited(&host, state.interval_ms);

                    if attempt >= self.config.max_retries {
                        tracing::warn!(
                            host = %host,
                            attempts = attempt + 1,
                            interval_ms = state.interval_ms,
                            "Gateway still rate limiting, giving up"
                        );
                        return result;
                    }

                    attempt += 1;
                    tracing::warn!(
                        host = %host,
                        attempt,
                        interval_ms = state.interval_ms,
                        "Gateway returned 429, backing off"
                    );
                }
                Ok(response) => {
                    metrics::record_http_request(&host, response.status);
                    state.interval_ms = backoff::relax(state.interval_ms, &self.config);
                    state.next_allowed_at =
                        Instant::now() + backoff::as_duration(state.interval_ms);
                    metrics::record_rate_interval(&host, state.interval_ms);
                    return result;
                }
                Err(err) => {
                    metrics::record_http_request(&host, err.status().unwrap_or(0));
                    state.next_allowed_at =
                        Instant::now() + backoff::as_duration(state.interval_ms);
                    return result;
                }
            }
        }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for RateLimitedHttpClient<T> {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        RateLimitedHttpClient::post_json(self, url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays scripted statuses and tracks concurrency.
    struct Scripted {
        statuses: std::sync::Mutex<VecDeque<u16>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            Self {
                statuses: std::sync::Mutex::new(statuses.iter().copied().collect()),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn post_json(&self, _url: &str, _body: &Value) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
            if status == 200 {
                Ok(HttpResponse::ok("{}"))
            } else {
                Err(TransportError::Status {
                    status,
                    body: String::new(),
                })
            }
        }
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            base_interval_ms: 100,
            max_interval_ms: 800,
            relax_step_ms: 50,
            max_retries: 3,
        }
    }

    fn client(statuses: &[u16]) -> RateLimitedHttpClient<Scripted> {
        RateLimitedHttpClient::new(
            Scripted::new(statuses),
            config(),
            vec!["trongrid.io".to_string()],
        )
    }

    const URL: &str = "https://api.trongrid.io/wallet/getnowblock";

    #[test]
    fn test_host_matching() {
        let client = client(&[]);
        assert!(client.applies_to("api.trongrid.io"));
        assert!(client.applies_to("trongrid.io"));
        assert!(client.applies_to("NILE.TRONGRID.IO"));
        assert!(!client.applies_to("nottrongrid.io"));
        assert!(!client.applies_to("localhost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_429_then_succeeds() {
        let client = client(&[429, 429]);
        let result = client.post_json(URL, &Value::Null).await;
        assert!(result.is_ok());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);

        // 100 → 200 → 400 on the two 429s, then relaxed by one step.
        let state = client.state("api.trongrid.io").await.unwrap();
        assert_eq!(state.interval_ms, 350);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_429_when_retries_exhausted() {
        let client = client(&[429, 429, 429, 429, 429]);
        let err = client.post_json(URL, &Value::Null).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 4);

        let state = client.state("api.trongrid.io").await.unwrap();
        assert_eq!(state.interval_ms, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_non_decreasing_then_relaxes() {
        let client = client(&[429; 8]);
        let mut last = config().base_interval_ms;
        for _ in 0..2 {
            let _ = client.post_json(URL, &Value::Null).await;
            let state = client.state("api.trongrid.io").await.unwrap();
            assert!(state.interval_ms >= last);
            assert!(state.interval_ms <= 800);
            last = state.interval_ms;
        }
        // Script exhausted: the next call succeeds and the interval drops.
        client.post_json(URL, &Value::Null).await.unwrap();
        let relaxed = client.state("api.trongrid.io").await.unwrap().interval_ms;
        assert!(relaxed < last);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_request_in_flight_per_host() {
        let client = Arc::new(client(&[]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.post_json(URL, &Value::Null).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 8);
        assert_eq!(client.inner().max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_hosts_bypass_limiter() {
        let client = Arc::new(client(&[429]));
        let err = client
            .post_json("http://localhost:8090/wallet/getnowblock", &Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 1);
        assert!(client.state("localhost").await.is_none());
    }
}
