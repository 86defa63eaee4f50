//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and relations
//! between fields. All errors are collected, not just the first.

use std::fmt;

use crate::config::schema::EngineConfig;

/// A single semantic problem in a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check(errors: &mut Vec<ValidationError>, ok: bool, field: &'static str, message: &str) {
    if !ok {
        errors.push(ValidationError {
            field,
            message: message.to_string(),
        });
    }
}

/// Validate a configuration, returning every violation found.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check(
        &mut errors,
        url::Url::parse(&config.tron.gateway_url).is_ok(),
        "tron.gateway_url",
        "must be an absolute URL",
    );
    check(
        &mut errors,
        config.tron.request_timeout_secs > 0,
        "tron.request_timeout_secs",
        "must be greater than 0",
    );
    check(
        &mut errors,
        config.tron.witness_cache_ttl_secs > 0,
        "tron.witness_cache_ttl_secs",
        "must be greater than 0",
    );

    check(
        &mut errors,
        url::Url::parse(&config.evm.rpc_url).is_ok(),
        "evm.rpc_url",
        "must be an absolute URL",
    );
    check(
        &mut errors,
        config.evm.gas_price_multiplier >= 1.0,
        "evm.gas_price_multiplier",
        "must be at least 1.0",
    );
    check(
        &mut errors,
        config.evm.gas_limit_buffer >= 1.0,
        "evm.gas_limit_buffer",
        "must be at least 1.0",
    );

    let rl = &config.rate_limit;
    check(
        &mut errors,
        rl.base_interval_ms > 0,
        "rate_limit.base_interval_ms",
        "must be greater than 0",
    );
    check(
        &mut errors,
        rl.max_interval_ms >= rl.base_interval_ms,
        "rate_limit.max_interval_ms",
        "must not be below base_interval_ms",
    );
    check(
        &mut errors,
        rl.relax_step_ms > 0,
        "rate_limit.relax_step_ms",
        "must be greater than 0",
    );

    check(
        &mut errors,
        config.polling.interval_ms > 0,
        "polling.interval_ms",
        "must be greater than 0",
    );
    check(
        &mut errors,
        config.rpc_cache.max_entries > 0,
        "rpc_cache.max_entries",
        "must be greater than 0",
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
