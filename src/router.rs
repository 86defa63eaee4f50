//! Routes wallet intents to the chain that executes them and keeps the
//! transaction history current.
//!
//! ```text
//! SendIntent ─┬─ Tron              → ProtocolClient (TRX or TRC-20)
//!             ├─ Evm + Eoa         → EvmSender (native or ERC-20)
//!             └─ Evm + Safe        → SafeOrchestrator::propose
//! StakeIntent ─┬─ Stake, Claim     → TronSession (in-flight guard)
//!              └─ Unstake, Withdraw → ProtocolClient
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{Classify, ErrorKind};
use crate::evm::erc20;
use crate::evm::rpc::JsonRpcTransport;
use crate::evm::safe::{Proposal, SafeOrchestrator, SafeQueue};
use crate::evm::sender::EvmSender;
use crate::evm::types::EvmError;
use crate::http::HttpTransport;
use crate::records::{ChainTarget, ConfirmationOutcome, TransactionLog, TransactionRecord};
use crate::tron::client::ProtocolClient;
use crate::tron::session::{TronAction, TronSession};
use crate::tron::types::{BroadcastReceipt, Resource, TronError};
use crate::wallet::SigningKey;

/// Which kind of account sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountKind {
    Eoa,
    Safe { address: Address },
}

/// Transfer of native currency or a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendIntent {
    pub chain: ChainTarget,
    pub account: AccountKind,
    /// Recipient, in the chain's own address format.
    pub to: String,
    /// Smallest unit (sun, wei, token base units).
    pub amount: U256,
    /// Token contract; `None` sends native currency.
    pub token: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeAction {
    Stake,
    Unstake,
    WithdrawUnfrozen,
    ClaimReward,
}

/// A TRON resource operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeIntent {
    pub action: StakeAction,
    /// Ignored by `WithdrawUnfrozen` and `ClaimReward`.
    #[serde(default)]
    pub amount_sun: u64,
    #[serde(default = "default_resource")]
    pub resource: Resource,
}

fn default_resource() -> Resource {
    Resource::Energy
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Broadcast; the record is in the log.
    Submitted(TransactionRecord),
    /// Safe proposal waiting for more owners.
    AwaitingSignatures { safe_tx_hash: B256, have: usize, need: u64 },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Tron(#[from] TronError),

    #[error(transparent)]
    Evm(#[from] EvmError),

    #[error("no client configured for {0}")]
    UnsupportedChain(ChainTarget),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Classify for RouteError {
    fn kind(&self) -> ErrorKind {
        match self {
            RouteError::Tron(err) => err.kind(),
            RouteError::Evm(err) => err.kind(),
            RouteError::UnsupportedChain(_) | RouteError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

struct TronRoute<T> {
    session: Arc<TronSession<T>>,
}

impl<T: HttpTransport> TronRoute<T> {
    fn client(&self) -> &ProtocolClient<T> {
        self.session.client()
    }

    fn gateway(&self) -> &str {
        self.session.gateway()
    }
}

/// One signing key, one TRON gateway, any number of EVM chains.
pub struct TransactionRouter<T, R> {
    key: SigningKey,
    log: TransactionLog,
    tron: Option<TronRoute<T>>,
    evm: HashMap<u64, SafeOrchestrator<R>>,
}

impl<T: HttpTransport, R: JsonRpcTransport> TransactionRouter<T, R> {
    pub fn new(key: SigningKey, log: TransactionLog) -> Self {
        Self {
            key,
            log,
            tron: None,
            evm: HashMap::new(),
        }
    }

    /// Route TRON intents through a new session signed by the router's key.
    pub fn with_tron(self, client: Arc<ProtocolClient<T>>, gateway: impl Into<String>) -> Self {
        let session = Arc::new(TronSession::new(client, self.key.clone(), gateway));
        self.with_tron_session(session)
    }

    /// Route TRON intents through `session`, sharing its in-flight guard with
    /// anything else that holds it (a finance saga, for one).
    pub fn with_tron_session(mut self, session: Arc<TronSession<T>>) -> Self {
        self.tron = Some(TronRoute { session });
        self
    }

    pub fn tron_session(&self) -> Option<&Arc<TronSession<T>>> {
        self.tron.as_ref().map(|route| &route.session)
    }

    /// Register an EVM chain; Safe proposals on it go to `safe_queue`.
    pub fn with_evm(mut self, sender: EvmSender<R>, safe_queue: SafeQueue) -> Self {
        let chain_id = sender.chain_id();
        self.evm
            .insert(chain_id, SafeOrchestrator::new(sender, safe_queue, self.log.clone()));
        self
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn safe(&self, chain_id: u64) -> Option<&SafeOrchestrator<R>> {
        self.evm.get(&chain_id)
    }

    fn tron(&self) -> Result<&TronRoute<T>, RouteError> {
        self.tron
            .as_ref()
            .ok_or(RouteError::UnsupportedChain(ChainTarget::Tron))
    }

    fn evm(&self, chain_id: u64) -> Result<&SafeOrchestrator<R>, RouteError> {
        self.evm
            .get(&chain_id)
            .ok_or(RouteError::UnsupportedChain(ChainTarget::Evm { chain_id }))
    }

    /// Route a transfer. Failures are recorded before being returned.
    pub async fn send(&self, intent: &SendIntent) -> Result<RouteOutcome, RouteError> {
        let summary = intent.summary.clone().unwrap_or_else(|| describe_send(intent));
        let result = match (intent.chain, intent.account) {
            (ChainTarget::Tron, AccountKind::Eoa) => self.send_tron(intent, &summary).await,
            (ChainTarget::Tron, AccountKind::Safe { .. }) => Err(RouteError::InvalidInput(
                "Safe accounts exist on EVM chains only".into(),
            )),
            (ChainTarget::Evm { chain_id }, AccountKind::Eoa) => {
                self.send_evm(chain_id, intent, &summary).await
            }
            (ChainTarget::Evm { chain_id }, AccountKind::Safe { address }) => {
                self.send_safe(chain_id, address, intent, &summary).await
            }
        };
        self.record_failure(intent.chain, &summary, result)
    }

    async fn send_tron(&self, intent: &SendIntent, summary: &str) -> Result<RouteOutcome, RouteError> {
        let route = self.tron()?;
        let receipt = match &intent.token {
            None => {
                let amount_sun = u64::try_from(intent.amount).map_err(|_| {
                    RouteError::InvalidInput(format!("amount {} exceeds the sun range", intent.amount))
                })?;
                route
                    .client()
                    .send_native_transfer(route.gateway(), &self.key, &intent.to, amount_sun)
                    .await?
            }
            Some(token) => {
                route
                    .client()
                    .send_token_transfer(route.gateway(), &self.key, token, &intent.to, intent.amount)
                    .await?
            }
        };
        Ok(self.record_tron(receipt, summary))
    }

    async fn send_evm(
        &self,
        chain_id: u64,
        intent: &SendIntent,
        summary: &str,
    ) -> Result<RouteOutcome, RouteError> {
        let sender = self.evm(chain_id)?.sender();
        let to = parse_evm_address(&intent.to)?;
        let tx_hash = match &intent.token {
            None => sender.send_native(&self.key, to, intent.amount).await?,
            Some(token) => {
                let token = parse_evm_address(token)?;
                sender.send_erc20(&self.key, token, to, intent.amount).await?
            }
        };
        let record = TransactionRecord::submitted(intent.chain, tx_hash.to_string(), summary);
        self.log.push(record.clone());
        Ok(RouteOutcome::Submitted(record))
    }

    async fn send_safe(
        &self,
        chain_id: u64,
        safe: Address,
        intent: &SendIntent,
        summary: &str,
    ) -> Result<RouteOutcome, RouteError> {
        let orchestrator = self.evm(chain_id)?;
        let to = parse_evm_address(&intent.to)?;
        if intent.amount.is_zero() {
            return Err(RouteError::InvalidInput("amount must be positive".into()));
        }

        let (target, value, data) = match &intent.token {
            None => (to, intent.amount, Default::default()),
            Some(token) => (
                parse_evm_address(token)?,
                U256::ZERO,
                erc20::transfer_calldata(to, intent.amount),
            ),
        };

        match orchestrator
            .propose(&self.key, safe, target, value, data, summary)
            .await?
        {
            Proposal::Executed(execution) => {
                let record = self
                    .log
                    .get(&execution.record_id)
                    .ok_or_else(|| RouteError::InvalidInput("execution record missing".into()))?;
                Ok(RouteOutcome::Submitted(record))
            }
            Proposal::Queued {
                safe_tx_hash,
                have,
                need,
            } => Ok(RouteOutcome::AwaitingSignatures {
                safe_tx_hash,
                have,
                need,
            }),
        }
    }

    /// Route a TRON resource operation.
    ///
    /// Stake and claim run through the session's in-flight guard and wait for
    /// confirmation; a second one for the same step while the first is
    /// outstanding fails with "still processing".
    pub async fn stake(&self, intent: &StakeIntent) -> Result<RouteOutcome, RouteError> {
        let summary = describe_stake(intent);
        let result = async {
            let route = self.tron()?;
            let guarded = match intent.action {
                StakeAction::Stake => Some(TronAction::Stake {
                    amount_sun: intent.amount_sun,
                    resource: intent.resource,
                }),
                StakeAction::ClaimReward => Some(TronAction::ClaimReward),
                StakeAction::Unstake | StakeAction::WithdrawUnfrozen => None,
            };
            if let Some(action) = guarded {
                let result = route.session.execute(&action).await?;
                return Ok(self.record_tron_outcome(result.receipt, &result.confirmation, &summary));
            }

            let (client, gateway) = (route.client(), route.gateway());
            let receipt = match intent.action {
                StakeAction::Unstake => {
                    client
                        .unstake(gateway, &self.key, intent.amount_sun, intent.resource)
                        .await?
                }
                _ => client.withdraw_unfrozen(gateway, &self.key).await?,
            };
            Ok::<_, RouteError>(self.record_tron(receipt, &summary))
        }
        .await;
        self.record_failure(ChainTarget::Tron, &summary, result)
    }

    /// Record a guarded action together with what confirmation polling saw.
    fn record_tron_outcome(
        &self,
        receipt: BroadcastReceipt,
        confirmation: &ConfirmationOutcome,
        summary: &str,
    ) -> RouteOutcome {
        let record = TransactionRecord::submitted(ChainTarget::Tron, receipt.txid, summary);
        let id = self.log.push(record.clone());
        if matches!(confirmation, ConfirmationOutcome::Confirmed { .. }) {
            if let Err(err) = self.log.apply_outcome(&id, confirmation) {
                tracing::debug!(error = %err, "Confirmation not recorded");
            }
        }
        RouteOutcome::Submitted(self.log.get(&id).unwrap_or(record))
    }

    fn record_tron(&self, receipt: BroadcastReceipt, summary: &str) -> RouteOutcome {
        let record = TransactionRecord::submitted(ChainTarget::Tron, receipt.txid, summary);
        self.log.push(record.clone());
        RouteOutcome::Submitted(record)
    }

    fn record_failure(
        &self,
        chain: ChainTarget,
        summary: &str,
        result: Result<RouteOutcome, RouteError>,
    ) -> Result<RouteOutcome, RouteError> {
        if let Err(err) = &result {
            tracing::warn!(%chain, summary, error = %err, kind = ?err.kind(), "Intent failed");
            self.log
                .push(TransactionRecord::failed(chain, summary, err.to_string()));
        }
        result
    }

    /// Probe every submitted record once and apply verdicts. Returns how many
    /// records reached a final state.
    pub async fn poll_pending(&self) -> usize {
        let pending = self.log.pending();
        let probes = pending.iter().map(|record| async move {
            let hash = record.hash.as_deref().unwrap_or_default();
            (record.id, self.probe(record.chain, hash).await)
        });

        let mut finalized = 0;
        for (id, outcome) in join_all(probes).await {
            match outcome {
                Some(ConfirmationOutcome::Unresolved) | None => {}
                Some(outcome) => {
                    if self.log.apply_outcome(&id, &outcome).is_ok() {
                        finalized += 1;
                    }
                }
            }
        }
        if finalized > 0 {
            tracing::info!(finalized, "Pending transactions resolved");
        }
        finalized
    }

    async fn probe(&self, chain: ChainTarget, hash: &str) -> Option<ConfirmationOutcome> {
        let result = match chain {
            ChainTarget::Tron => {
                let route = self.tron.as_ref()?;
                route
                    .client()
                    .check_confirmation(route.gateway(), hash)
                    .await
                    .map_err(|e| e.to_string())
            }
            ChainTarget::Evm { chain_id } => {
                let sender = self.evm.get(&chain_id)?.sender();
                let hash: B256 = hash.parse().ok()?;
                sender.check_receipt(hash).await.map_err(|e| e.to_string())
            }
        };
        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(%chain, hash, error = %err, "Status probe failed");
                None
            }
        }
    }
}

fn parse_evm_address(value: &str) -> Result<Address, RouteError> {
    value
        .parse()
        .map_err(|_| RouteError::InvalidInput(format!("invalid EVM address: {}", value)))
}

fn describe_send(intent: &SendIntent) -> String {
    match &intent.token {
        None => format!("send {} to {}", intent.amount, intent.to),
        Some(token) => format!("send {} of {} to {}", intent.amount, token, intent.to),
    }
}

fn describe_stake(intent: &StakeIntent) -> String {
    match intent.action {
        StakeAction::Stake => format!("stake {} sun for {}", intent.amount_sun, intent.resource.as_str()),
        StakeAction::Unstake => format!("unstake {} sun of {}", intent.amount_sun, intent.resource.as_str()),
        StakeAction::WithdrawUnfrozen => "withdraw unfrozen TRX".to_string(),
        StakeAction::ClaimReward => "claim voting reward".to_string(),
    }
}
