//! Interval arithmetic for the gateway limiter.
//!
//! Multiplicative increase on 429, additive decrease on success:
//! ```text
//! 429:     interval = min(interval * 2, max)
//! success: interval = max(interval - step, base)
//! ```

use std::time::Duration;

use crate::config::RateLimitConfig;

/// Spacing after a rate-limited response.
pub fn back_off(interval_ms: u64, config: &RateLimitConfig) -> u64 {
    interval_ms
        .max(config.base_interval_ms)
        .saturating_mul(2)
        .min(config.max_interval_ms)
}

/// Spacing after a successful response.
pub fn relax(interval_ms: u64, config: &RateLimitConfig) -> u64 {
    interval_ms
        .saturating_sub(config.relax_step_ms)
        .max(config.base_interval_ms)
}

/// Convenience for sleeping.
pub fn as_duration(interval_ms: u64) -> Duration {
    Duration::from_millis(interval_ms)
}
