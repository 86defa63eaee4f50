//! Claim → stake → vote.
//!
//! # Flow
//! ```text
//! claim:  reward == 0 → skipped, else claim and confirm
//! stake:  baseline = tronPowerLimit
//!         amount  = fixed | balance - reserve (≤ 0 fails before any tx)
//!         stake and confirm
//! vote:   poll tronPowerLimit until ≥ baseline + amount/1e6 (or timeout)
//!         targets = previous votes that are still witnesses
//!         split total power evenly, remainder to the first targets
//! ```
//!
//! A failed step stops the run and leaves a [`FailedSnapshot`] that
//! [`FinanceSaga::retry_failed_step`] re-executes as-is.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::{EngineConfig, PollingConfig, SagaConfig};
use crate::http::HttpTransport;
use crate::records::ConfirmationOutcome;
use crate::saga::status::{
    FailedSnapshot, SagaReport, SnapshotPayload, StakeAmount, StepState, StepStatus,
};
use crate::tron::action::ActionStep;
use crate::tron::address::TronAddress;
use crate::tron::session::{ActionResult, TronAction, TronSession};
use crate::tron::types::{Resource, TronError, TronResult, VoteItem, SUN_PER_TRX};
use crate::tron::witness;

/// What a run should stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaPlan {
    pub stake: StakeAmount,
    pub resource: Resource,
}

/// Split `total_power` evenly; the first `total % n` targets get one extra.
/// Zero counts are dropped.
pub fn distribute_votes(total_power: u64, targets: &[TronAddress]) -> Vec<VoteItem> {
    if targets.is_empty() {
        return Vec::new();
    }
    let n = targets.len() as u64;
    let base = total_power / n;
    let remainder = total_power % n;

    targets
        .iter()
        .enumerate()
        .map(|(i, address)| VoteItem {
            address: *address,
            count: base + u64::from((i as u64) < remainder),
        })
        .filter(|vote| vote.count > 0)
        .collect()
}

#[derive(Debug, Default)]
struct StepDone {
    txid: Option<String>,
    detail: Option<String>,
    skipped: bool,
    /// Set by the stake step for the vote step.
    min_power: Option<u64>,
}

struct StepFailure {
    error: TronError,
    retry_with: SnapshotPayload,
}

type StepResult = Result<StepDone, StepFailure>;

fn fail(error: TronError, retry_with: SnapshotPayload) -> StepFailure {
    StepFailure { error, retry_with }
}

pub struct FinanceSaga<T> {
    session: Arc<TronSession<T>>,
    config: SagaConfig,
    polling: PollingConfig,
    steps: Vec<StepStatus>,
    failed: Option<FailedSnapshot>,
}

impl<T: HttpTransport> FinanceSaga<T> {
    pub fn new(session: Arc<TronSession<T>>, config: &EngineConfig) -> Self {
        Self {
            session,
            config: config.saga.clone(),
            polling: config.polling.clone(),
            steps: ActionStep::ALL.iter().map(|s| StepStatus::pending(*s)).collect(),
            failed: None,
        }
    }

    /// Plan with the configured default resource.
    pub fn plan(&self, stake: StakeAmount) -> SagaPlan {
        SagaPlan {
            stake,
            resource: self.config.default_resource,
        }
    }

    pub fn steps(&self) -> &[StepStatus] {
        &self.steps
    }

    pub fn failed_step(&self) -> Option<&FailedSnapshot> {
        self.failed.as_ref()
    }

    pub fn report(&self) -> SagaReport {
        SagaReport {
            steps: self.steps.clone(),
            failed: self.failed.clone(),
        }
    }

    /// Run all three steps in order, stopping at the first failure.
    pub async fn run(&mut self, plan: &SagaPlan) -> SagaReport {
        self.steps = ActionStep::ALL.iter().map(|s| StepStatus::pending(*s)).collect();
        self.failed = None;

        tracing::info!(stake = ?plan.stake, resource = plan.resource.as_str(), "Finance saga started");

        if self.run_step(SnapshotPayload::Claim).await.is_none() {
            return self.report();
        }

        let stake = SnapshotPayload::ResolveStake {
            amount: plan.stake,
            resource: plan.resource,
        };
        let Some(staked) = self.run_step(stake).await else {
            return self.report();
        };

        let min_power = staked.min_power.unwrap_or(0);
        self.run_step(SnapshotPayload::PlanVotes { min_power }).await;

        let report = self.report();
        tracing::info!(succeeded = report.succeeded(), "Finance saga finished");
        report
    }

    /// Re-execute the recorded failed step with its recorded payload.
    pub async fn retry_failed_step(&mut self) -> TronResult<StepStatus> {
        let snapshot = self
            .failed
            .take()
            .ok_or_else(|| TronError::InvalidInput("no failed step to retry".into()))?;

        tracing::info!(step = ?snapshot.step, "Retrying failed saga step");
        self.run_step(snapshot.payload).await;
        Ok(self.status(snapshot.step).clone())
    }

    fn status(&mut self, key: ActionStep) -> &mut StepStatus {
        let index = ActionStep::ALL.iter().position(|s| *s == key).unwrap_or(0);
        &mut self.steps[index]
    }

    async fn run_step(&mut self, payload: SnapshotPayload) -> Option<StepDone> {
        let step = payload.step();
        self.status(step).transition(StepState::Running, None, None);

        let outcome = self.perform(payload).await;
        match outcome {
            Ok(done) => {
                let state = if done.skipped {
                    StepState::Skipped
                } else {
                    StepState::Success
                };
                self.status(step)
                    .transition(state, done.detail.clone(), done.txid.clone());
                tracing::info!(step = ?step, state = ?state, txid = ?done.txid, "Saga step finished");
                Some(done)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                tracing::warn!(step = ?step, error = %message, "Saga step failed");
                self.status(step)
                    .transition(StepState::Failed, Some(message.clone()), None);
                self.failed = Some(FailedSnapshot {
                    step,
                    payload: failure.retry_with,
                    error: message,
                });
                None
            }
        }
    }

    async fn perform(&self, payload: SnapshotPayload) -> StepResult {
        match payload {
            SnapshotPayload::Claim => self.claim().await,
            SnapshotPayload::ResolveStake { amount, resource } => {
                self.resolve_stake(amount, resource).await
            }
            SnapshotPayload::Stake {
                amount_sun,
                resource,
                baseline_power,
            } => self.stake(amount_sun, resource, baseline_power).await,
            SnapshotPayload::PlanVotes { min_power } => self.plan_and_vote(min_power).await,
            SnapshotPayload::Vote { votes } => self.vote(votes, None).await,
        }
    }

    async fn claim(&self) -> StepResult {
        let client = self.session.client();
        let reward = client
            .get_reward(self.session.gateway(), &self.session.address())
            .await
            .map_err(|e| fail(e, SnapshotPayload::Claim))?;

        if reward == 0 {
            return Ok(StepDone {
                skipped: true,
                detail: Some("no reward to claim".into()),
                ..Default::default()
            });
        }

        let result = self
            .session
            .execute(&TronAction::ClaimReward)
            .await
            .map_err(|e| fail(e, SnapshotPayload::Claim))?;
        Ok(done(result, Some(format!("claimed {} sun", reward))))
    }

    async fn resolve_stake(&self, amount: StakeAmount, resource: Resource) -> StepResult {
        let retry = SnapshotPayload::ResolveStake { amount, resource };
        let client = self.session.client();
        let gateway = self.session.gateway();
        let address = self.session.address();

        let baseline_power = client
            .get_account_resource(gateway, &address)
            .await
            .map_err(|e| fail(e, retry.clone()))?
            .tron_power_limit;

        let amount_sun = match amount {
            StakeAmount::Fixed { amount_sun } => amount_sun,
            StakeAmount::FullBalance => {
                let balance = client
                    .get_account(gateway, &address)
                    .await
                    .map_err(|e| fail(e, retry.clone()))?
                    .balance;
                balance.saturating_sub(self.config.stake_reserve_sun)
            }
        };

        if amount_sun == 0 {
            return Err(fail(
                TronError::InvalidInput(format!(
                    "nothing to stake after keeping a {} sun reserve",
                    self.config.stake_reserve_sun
                )),
                retry,
            ));
        }

        self.stake(amount_sun, resource, baseline_power).await
    }

    async fn stake(&self, amount_sun: u64, resource: Resource, baseline_power: u64) -> StepResult {
        let action = TronAction::Stake {
            amount_sun,
            resource,
        };
        let result = self.session.execute(&action).await.map_err(|e| {
            fail(
                e,
                SnapshotPayload::Stake {
                    amount_sun,
                    resource,
                    baseline_power,
                },
            )
        })?;

        let mut step = done(
            result,
            Some(format!("staked {} sun for {}", amount_sun, resource.as_str())),
        );
        step.min_power = Some(baseline_power + amount_sun / SUN_PER_TRX);
        Ok(step)
    }

    async fn plan_and_vote(&self, min_power: u64) -> StepResult {
        let retry = SnapshotPayload::PlanVotes { min_power };
        let (power, lagging) = self
            .wait_for_power(min_power)
            .await
            .map_err(|e| fail(e, retry.clone()))?;

        let client = self.session.client();
        let gateway = self.session.gateway();
        let account = client
            .get_account(gateway, &self.session.address())
            .await
            .map_err(|e| fail(e, retry.clone()))?;
        let witnesses = client
            .get_node_witnesses(gateway)
            .await
            .map_err(|e| fail(e, retry.clone()))?;

        let mut targets: Vec<TronAddress> = Vec::new();
        for vote in &account.votes {
            if witness::contains(&witnesses, &vote.address) && !targets.contains(&vote.address) {
                targets.push(vote.address);
            }
        }
        let dropped = account.votes.len().saturating_sub(targets.len());
        if dropped > 0 {
            tracing::warn!(dropped, "Previous vote targets are no longer witnesses");
        }

        let votes = distribute_votes(power, &targets);
        if votes.is_empty() {
            return Ok(StepDone {
                skipped: true,
                detail: Some("no valid vote targets".into()),
                ..Default::default()
            });
        }

        let lag = lagging.then(|| {
            format!(
                "voting power {} had not reached expected {}",
                power, min_power
            )
        });
        self.vote(votes, lag).await
    }

    async fn vote(&self, votes: Vec<VoteItem>, note: Option<String>) -> StepResult {
        let action = TronAction::Vote {
            votes: votes.clone(),
        };
        let result = self
            .session
            .execute(&action)
            .await
            .map_err(|e| fail(e, SnapshotPayload::Vote { votes: votes.clone() }))?;

        let total: u64 = votes.iter().map(|v| v.count).sum();
        let mut detail = format!("{} votes across {} witnesses", total, votes.len());
        if let Some(note) = note {
            detail = format!("{}; {}", detail, note);
        }
        Ok(done(result, Some(detail)))
    }

    /// Poll until voting power reaches `min_power`. On timeout, returns the
    /// last observed power with `true`.
    async fn wait_for_power(&self, min_power: u64) -> TronResult<(u64, bool)> {
        let client = self.session.client();
        let address = self.session.address();
        let poll = Duration::from_millis(self.polling.interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.polling.power_sync_timeout_secs);

        let mut last_power = None;
        let mut last_error = None;
        loop {
            match client
                .get_account_resource(self.session.gateway(), &address)
                .await
            {
                Ok(resource) if resource.tron_power_limit >= min_power => {
                    return Ok((resource.tron_power_limit, false));
                }
                Ok(resource) => last_power = Some(resource.tron_power_limit),
                Err(err) => last_error = Some(err),
            }

            if Instant::now() + poll > deadline {
                break;
            }
            sleep(poll).await;
        }

        match (last_power, last_error) {
            (Some(power), _) => {
                tracing::warn!(power, expected = min_power, "Voting power still syncing");
                Ok((power, true))
            }
            (None, Some(err)) => Err(err),
            (None, None) => Ok((0, true)),
        }
    }
}

fn done(result: ActionResult, detail: Option<String>) -> StepDone {
    let detail = match (&result.confirmation, detail) {
        (ConfirmationOutcome::Unresolved, Some(d)) => Some(format!("{}; confirmation pending", d)),
        (ConfirmationOutcome::Unresolved, None) => Some("confirmation pending".into()),
        (_, d) => d,
    };
    StepDone {
        txid: Some(result.receipt.txid),
        detail,
        skipped: false,
        min_power: None,
    }
}
