//! Step bookkeeping for the finance saga.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::tron::action::ActionStep;
use crate::tron::types::{Resource, VoteItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Success,
    Skipped,
    Failed,
}

/// Observable status of one saga step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub key: ActionStep,
    pub status: StepState,
    pub detail: Option<String>,
    pub txid: Option<String>,
    /// Milliseconds since epoch of the last transition.
    pub at: Option<u64>,
}

impl StepStatus {
    pub fn pending(key: ActionStep) -> Self {
        Self {
            key,
            status: StepState::Pending,
            detail: None,
            txid: None,
            at: None,
        }
    }

    pub(crate) fn transition(&mut self, status: StepState, detail: Option<String>, txid: Option<String>) {
        self.status = status;
        self.detail = detail;
        self.txid = txid;
        self.at = Some(now_millis());
    }
}

/// How much to stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeAmount {
    Fixed { amount_sun: u64 },
    /// Balance minus the configured reserve.
    FullBalance,
}

/// Everything needed to re-run one step exactly as it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotPayload {
    Claim,
    ResolveStake {
        amount: StakeAmount,
        resource: Resource,
    },
    Stake {
        amount_sun: u64,
        resource: Resource,
        baseline_power: u64,
    },
    PlanVotes {
        min_power: u64,
    },
    Vote {
        votes: Vec<VoteItem>,
    },
}

impl SnapshotPayload {
    pub fn step(&self) -> ActionStep {
        match self {
            SnapshotPayload::Claim => ActionStep::ClaimReward,
            SnapshotPayload::ResolveStake { .. } | SnapshotPayload::Stake { .. } => {
                ActionStep::StakeResource
            }
            SnapshotPayload::PlanVotes { .. } | SnapshotPayload::Vote { .. } => {
                ActionStep::VoteWitness
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSnapshot {
    pub step: ActionStep,
    pub payload: SnapshotPayload,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaReport {
    pub steps: Vec<StepStatus>,
    pub failed: Option<FailedSnapshot>,
}

impl SagaReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_none()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.status, StepState::Success | StepState::Skipped))
    }

    pub fn step(&self, key: ActionStep) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.key == key)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
