//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::tron::types::Resource;

/// Root configuration for the transaction engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// TRON gateway settings.
    pub tron: TronConfig,

    /// EVM JSON-RPC settings.
    pub evm: EvmConfig,

    /// Per-host gateway rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Confirmation and resource polling cadence.
    pub polling: PollingConfig,

    /// Short-TTL cache for read-only RPC results.
    pub rpc_cache: RpcCacheConfig,

    /// Claim/stake/vote workflow settings.
    pub saga: SagaConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// TRON gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TronConfig {
    /// Base URL of the HTTP gateway (e.g., "https://api.trongrid.io").
    pub gateway_url: String,

    /// Host suffixes that go through the rate limiter.
    pub rate_limited_hosts: Vec<String>,

    /// Optional API key, sent as `TRON-PRO-API-KEY`.
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Maximum energy fee for TRC-20 transfers, in sun.
    pub fee_limit_sun: u64,

    /// How long a fetched witness list stays fresh.
    pub witness_cache_ttl_secs: u64,
}

impl Default for TronConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://api.trongrid.io".to_string(),
            rate_limited_hosts: vec!["trongrid.io".to_string()],
            api_key: None,
            request_timeout_secs: 15,
            fee_limit_sun: 100_000_000,
            witness_cache_ttl_secs: 24 * 3600,
        }
    }
}

/// EVM integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvmConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Gas price multiplier (1.0 = node estimate, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,

    /// Multiplier applied to `eth_estimateGas`.
    pub gas_limit_buffer: f64,
}

impl Default for EvmConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 1,
            rpc_timeout_secs: 10,
            gas_price_multiplier: 1.2,
            max_gas_price_gwei: 500,
            gas_limit_buffer: 1.2,
        }
    }
}

/// Rate limiter configuration (per host).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Floor for the spacing between two requests, in milliseconds.
    pub base_interval_ms: u64,

    /// Ceiling the spacing may grow to under repeated 429s.
    pub max_interval_ms: u64,

    /// Amount subtracted from the spacing after each success.
    pub relax_step_ms: u64,

    /// Retries on 429 before the status is surfaced.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 200,
            max_interval_ms: 5_000,
            relax_step_ms: 50,
            max_retries: 3,
        }
    }
}

/// Polling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Delay between two polls, in milliseconds.
    pub interval_ms: u64,

    /// Give up waiting for a transaction after this many seconds.
    pub confirmation_timeout_secs: u64,

    /// Give up waiting for voting power to reflect a stake after this many seconds.
    pub power_sync_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            confirmation_timeout_secs: 60,
            power_sync_timeout_secs: 60,
        }
    }
}

/// Result cache for read-only RPC methods.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcCacheConfig {
    /// Lifetime of a cached result in milliseconds.
    pub ttl_ms: u64,

    /// Maximum number of cached results.
    pub max_entries: usize,
}

impl Default for RpcCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 2_000,
            max_entries: 256,
        }
    }
}

/// Claim/stake/vote workflow configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Balance kept aside for fees when staking the full balance, in sun.
    pub stake_reserve_sun: u64,

    /// Resource staked for when the caller does not choose one.
    pub default_resource: Resource,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            stake_reserve_sun: 5_000_000,
            default_resource: Resource::Energy,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
