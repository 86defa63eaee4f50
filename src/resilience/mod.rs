//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to a rate-limited gateway host:
//!     → http/rate_limited.rs (per-host queue, wait for next slot)
//!     → On 429: backoff.rs (double spacing, bounded)
//!     → On success: backoff.rs (relax spacing toward the floor)
//! ```
//!
//! # Design Decisions
//! - Only gateway hosts are limited; other hosts run at full speed
//! - Only 429 is retried here; everything else is surfaced to the caller
//! - Timeouts are enforced by the transport, not by the limiter

pub mod backoff;
