//! HTTP plumbing.
//!
//! # Data Flow
//! ```text
//! ProtocolClient
//!     → rate_limited.rs (per-host queue + AIMD spacing, gateway hosts only)
//!     → transport.rs (reqwest POST, non-2xx mapped to typed status errors)
//! ```

pub mod rate_limited;
pub mod transport;

pub use rate_limited::{RateLimitState, RateLimitedHttpClient};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};
