//! Multi-step staking workflow over a TRON session.
//!
//! Steps run strictly in order and each one waits for its own confirmation
//! before the next starts. Progress is exposed as [`StepStatus`] records.

pub mod finance;
pub mod status;

pub use finance::{distribute_votes, FinanceSaga, SagaPlan};
pub use status::{FailedSnapshot, SagaReport, SnapshotPayload, StakeAmount, StepState, StepStatus};
