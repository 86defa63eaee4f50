//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!
//! Consumers:
//!     → the binary installs a `tracing-subscriber` fmt layer
//!     → embedders install whatever metrics recorder they use
//! ```
//!
//! # Design Decisions
//! - Signing keys and raw signatures are never logged
//! - Metrics are cheap no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
