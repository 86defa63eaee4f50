//! A signing wallet bound to one gateway, with the in-flight guard applied.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::http::HttpTransport;
use crate::records::ConfirmationOutcome;
use crate::tron::action::{ActionGuard, ActionStep, TronActionState};
use crate::tron::address::TronAddress;
use crate::tron::client::ProtocolClient;
use crate::tron::types::{BroadcastReceipt, Resource, TronError, TronResult, VoteItem};
use crate::wallet::SigningKey;

/// A guarded wallet action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TronAction {
    ClaimReward,
    Stake { amount_sun: u64, resource: Resource },
    Vote { votes: Vec<VoteItem> },
}

impl TronAction {
    pub fn step(&self) -> ActionStep {
        match self {
            TronAction::ClaimReward => ActionStep::ClaimReward,
            TronAction::Stake { .. } => ActionStep::StakeResource,
            TronAction::Vote { .. } => ActionStep::VoteWitness,
        }
    }
}

/// Broadcast receipt plus what confirmation polling saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub receipt: BroadcastReceipt,
    pub confirmation: ConfirmationOutcome,
}

pub struct TronSession<T> {
    client: Arc<ProtocolClient<T>>,
    key: SigningKey,
    gateway: String,
    guard: ActionGuard,
}

impl<T: HttpTransport> TronSession<T> {
    pub fn new(client: Arc<ProtocolClient<T>>, key: SigningKey, gateway: impl Into<String>) -> Self {
        Self {
            client,
            key,
            gateway: gateway.into(),
            guard: ActionGuard::new(),
        }
    }

    pub fn client(&self) -> &ProtocolClient<T> {
        &self.client
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn address(&self) -> TronAddress {
        self.key.tron_address()
    }

    pub fn state(&self) -> TronActionState {
        self.guard.current()
    }

    /// Submit `action` and wait for its confirmation.
    ///
    /// Fails with "still processing" while another action with the same step
    /// key is in flight. An unresolved confirmation is returned as success.
    pub async fn execute(&self, action: &TronAction) -> TronResult<ActionResult> {
        let ticket = self.guard.begin(action.step())?;

        let submitted = match action {
            TronAction::ClaimReward => self.client.claim_reward(&self.gateway, &self.key).await,
            TronAction::Stake {
                amount_sun,
                resource,
            } => {
                self.client
                    .stake(&self.gateway, &self.key, *amount_sun, *resource)
                    .await
            }
            TronAction::Vote { votes } => self.client.vote(&self.gateway, &self.key, votes).await,
        };
        let receipt = match submitted {
            Ok(receipt) => receipt,
            Err(err) => {
                ticket.failed();
                return Err(err);
            }
        };
        ticket.submitted();

        let confirmation = self
            .client
            .wait_for_confirmation(&self.gateway, &receipt.txid)
            .await;
        match &confirmation {
            ConfirmationOutcome::Confirmed { .. } => ticket.confirmed(),
            ConfirmationOutcome::Failed { reason } => {
                ticket.failed();
                return Err(TronError::Reverted(format!("{} ({})", reason, receipt.txid)));
            }
            ConfirmationOutcome::Unresolved => ticket.release(),
        }

        Ok(ActionResult {
            receipt,
            confirmation,
        })
    }
}
