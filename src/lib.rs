//! Multi-chain wallet transaction engine.
//!
//! TRON gateway client with permission fallback and confirmation polling,
//! EVM signing with optimistic nonces and request collapsing, Safe multisig
//! orchestration, and a resumable claim → stake → vote workflow.

pub mod config;
pub mod errors;
pub mod evm;
pub mod http;
pub mod observability;
pub mod records;
pub mod resilience;
pub mod router;
pub mod saga;
pub mod tron;
pub mod wallet;

pub use config::schema::EngineConfig;
pub use errors::{Classify, ErrorKind};
pub use records::{ChainTarget, TransactionLog, TransactionRecord, TxStatus};
pub use router::{RouteError, RouteOutcome, SendIntent, StakeIntent, TransactionRouter};
pub use wallet::SigningKey;
