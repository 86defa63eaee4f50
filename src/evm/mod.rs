//! EVM integration.
//!
//! # Layers
//! ```text
//! HttpJsonRpc (rpc.rs)
//!     → DeduplicatingRpcProvider (dedup.rs): collapse identical reads
//!     → EvmSender (sender.rs): gas, nonce from NonceQueue (nonce.rs), sign, broadcast
//!     → SafeOrchestrator (safe.rs): propose, collect signatures, execTransaction
//! ```

pub mod dedup;
pub mod erc20;
pub mod nonce;
pub mod rpc;
pub mod safe;
pub mod sender;
pub mod types;

pub use dedup::DeduplicatingRpcProvider;
pub use erc20::TokenMetadata;
pub use nonce::{NonceFailure, NonceQueue};
pub use rpc::{HttpJsonRpc, JsonRpcTransport, RpcExt};
pub use safe::{Proposal, SafeExecution, SafeInfo, SafeOrchestrator, SafePendingTx, SafeQueue, SafeTxPhase};
pub use sender::EvmSender;
pub use types::{EvmError, EvmResult, RpcError};
