//! Metrics collection.
//!
//! # Metrics
//! - `wallet_http_requests_total` (counter): gateway exchanges by host, status
//! - `wallet_rate_limited_total` (counter): 429 responses by host
//! - `wallet_rate_limit_interval_ms` (gauge): current per-host spacing
//! - `wallet_broadcasts_total` (counter): broadcasts by chain, outcome
//! - `wallet_rpc_dedup_total` (counter): collapsed RPC calls by method, tier
//! - `wallet_nonce_resets_total` (counter): optimistic nonce invalidations

/// Record one gateway exchange.
pub fn record_http_request(host: &str, status: u16) {
    metrics::counter!(
        "wallet_http_requests_total",
        "host" => host.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a 429 and the spacing the limiter moved to.
pub fn record_rate_limited(host: &str, interval_ms: u64) {
    metrics::counter!("wallet_rate_limited_total", "host" => host.to_string()).increment(1);
    record_rate_interval(host, interval_ms);
}

/// Record the current per-host spacing.
pub fn record_rate_interval(host: &str, interval_ms: u64) {
    metrics::gauge!("wallet_rate_limit_interval_ms", "host" => host.to_string())
        .set(interval_ms as f64);
}

/// Record a broadcast attempt outcome.
pub fn record_broadcast(chain: &'static str, outcome: &'static str) {
    metrics::counter!("wallet_broadcasts_total", "chain" => chain, "outcome" => outcome)
        .increment(1);
}

/// Record an RPC call served without its own upstream request.
///
/// `tier` is `"in_flight"` or `"cached"`.
pub fn record_rpc_dedup(method: &str, tier: &'static str) {
    metrics::counter!(
        "wallet_rpc_dedup_total",
        "method" => method.to_string(),
        "tier" => tier
    )
    .increment(1);
}

/// Record a nonce counter invalidation.
pub fn record_nonce_reset(chain_id: u64) {
    metrics::counter!("wallet_nonce_resets_total", "chain_id" => chain_id.to_string())
        .increment(1);
}
