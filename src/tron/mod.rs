//! TRON protocol client.
//!
//! # Data Flow
//! ```text
//! operation (stake, vote, transfer, ...)
//!     → client.rs: build via gateway (node computes txID)
//!     → client.rs: verify txID against raw_data_hex, sign digest
//!     → client.rs: broadcast, result must be true
//!     → on permission mismatch: permission.rs picks an active permission,
//!       rebuild under it, retry once
//!     → confirm.rs: poll transaction info until verdict or timeout
//! ```

pub mod action;
pub mod address;
pub mod client;
pub mod confirm;
pub mod normalize;
pub mod permission;
pub mod session;
pub mod types;
pub mod witness;

pub use action::{ActionGuard, ActionPhase, ActionStep, TronActionState};
pub use address::TronAddress;
pub use client::{BuildRequest, ProtocolClient};
pub use session::{ActionResult, TronAction, TronSession};
pub use types::{
    AccountInfo, AccountResource, BroadcastReceipt, ContractType, Resource, TronError, TronResult,
    TxOutcome, VoteItem, MAX_SAFE_SUN, SUN_PER_TRX,
};
pub use witness::Witness;
