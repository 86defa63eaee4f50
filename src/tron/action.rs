//! In-flight guard for wallet actions.
//!
//! Each step key has at most one action between signing and its terminal
//! state. A second `begin` on a busy key fails with "still processing"; other
//! keys are unaffected.
//!
//! ```text
//! idle/confirmed/failed ──begin──▶ signing ──submitted──▶ submitted
//!                                     │                      │
//!                                     └──────failed/drop─────┴──▶ failed
//!                                                            └──▶ confirmed
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::tron::types::{TronError, TronResult};

/// Keys of the actions the guard tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStep {
    ClaimReward,
    StakeResource,
    VoteWitness,
}

impl ActionStep {
    pub const ALL: [ActionStep; 3] = [
        ActionStep::ClaimReward,
        ActionStep::StakeResource,
        ActionStep::VoteWitness,
    ];
}

/// Lifecycle phase of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    #[default]
    Idle,
    Signing,
    Submitted,
    Confirmed,
    Failed,
}

impl ActionPhase {
    pub fn is_in_flight(self) -> bool {
        matches!(self, ActionPhase::Signing | ActionPhase::Submitted)
    }
}

/// Snapshot of the session's action state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TronActionState {
    pub phase: ActionPhase,
    pub step: Option<ActionStep>,
}

/// Tracks one phase per step key.
#[derive(Debug, Clone, Default)]
pub struct ActionGuard {
    // Never held across an await.
    phases: Arc<Mutex<HashMap<ActionStep, ActionPhase>>>,
}

impl ActionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `step` for a new action.
    pub fn begin(&self, step: ActionStep) -> TronResult<ActionTicket> {
        let mut phases = self.lock();
        let phase = phases.entry(step).or_default();
        if phase.is_in_flight() {
            return Err(TronError::StillProcessing(step));
        }
        *phase = ActionPhase::Signing;
        Ok(ActionTicket {
            guard: self.clone(),
            step,
            finished: false,
        })
    }

    pub fn phase(&self, step: ActionStep) -> ActionPhase {
        self.lock().get(&step).copied().unwrap_or_default()
    }

    /// The first in-flight action, or the session as idle.
    pub fn current(&self) -> TronActionState {
        let phases = self.lock();
        ActionStep::ALL
            .iter()
            .find_map(|step| {
                phases
                    .get(step)
                    .filter(|phase| phase.is_in_flight())
                    .map(|phase| TronActionState {
                        phase: *phase,
                        step: Some(*step),
                    })
            })
            .unwrap_or(TronActionState {
                phase: ActionPhase::Idle,
                step: None,
            })
    }

    fn set(&self, step: ActionStep, phase: ActionPhase) {
        self.lock().insert(step, phase);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ActionStep, ActionPhase>> {
        // A poisoned map still holds valid phases.
        self.phases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held while an action is in flight. Dropping it unfinished marks it failed.
#[derive(Debug)]
pub struct ActionTicket {
    guard: ActionGuard,
    step: ActionStep,
    finished: bool,
}

impl ActionTicket {
    pub fn step(&self) -> ActionStep {
        self.step
    }

    pub fn submitted(&self) {
        self.guard.set(self.step, ActionPhase::Submitted);
    }

    pub fn confirmed(mut self) {
        self.finish(ActionPhase::Confirmed);
    }

    pub fn failed(mut self) {
        self.finish(ActionPhase::Failed);
    }

    /// Release without a terminal verdict (confirmation still pending).
    pub fn release(mut self) {
        self.finish(ActionPhase::Idle);
    }

    fn finish(&mut self, phase: ActionPhase) {
        self.finished = true;
        self.guard.set(self.step, phase);
    }
}

impl Drop for ActionTicket {
    fn drop(&mut self) {
        if !self.finished {
            self.guard.set(self.step, ActionPhase::Failed);
        }
    }
}
