//! Safe multisig orchestration.
//!
//! # Flow
//! ```text
//! propose ──► sign safeTxHash ──► threshold == 1 ? execute
//!                                 └─ else queue (Signing) ◄── add_signature
//! execute ──► execTransaction (signatures sorted by owner) ──► Submitted
//! confirm_execution ──► Confirmed | Failed
//! ```
//!
//! Owner and threshold changes are self-calls proposed against the Safe's own
//! address, so they collect signatures like any other transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::{address, hex, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evm::rpc::{decode_return, JsonRpcTransport, RpcExt};
use crate::evm::sender::EvmSender;
use crate::evm::types::{EvmError, EvmResult};
use crate::records::{ChainTarget, ConfirmationOutcome, TransactionLog, TransactionRecord};
use crate::wallet::SigningKey;

sol! {
    #[allow(missing_docs)]
    interface ISafe {
        function nonce() external view returns (uint256);
        function getOwners() external view returns (address[]);
        function getThreshold() external view returns (uint256);
        function getTransactionHash(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            uint256 _nonce
        ) external view returns (bytes32);
        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool success);
        function addOwnerWithThreshold(address owner, uint256 _threshold) external;
        function removeOwner(address prevOwner, address owner, uint256 _threshold) external;
        function changeThreshold(uint256 _threshold) external;
    }
}

/// Head of the Safe's owner linked list.
pub const SENTINEL_OWNERS: Address = address!("0000000000000000000000000000000000000001");

/// `CALL`; delegate calls are never proposed.
const OPERATION_CALL: u8 = 0;

/// Safe convention: `v + 4` marks an `eth_sign` signature.
const ETH_SIGN_V_OFFSET: u8 = 4;

/// Known Safe revert codes.
const SAFE_ERRORS: &[(&str, &str)] = &[
    ("GS000", "Safe could not finish initialization"),
    ("GS001", "threshold needs to be defined"),
    ("GS010", "not enough gas to execute the Safe transaction"),
    ("GS011", "Safe could not pay gas costs with ether"),
    ("GS012", "Safe could not pay gas costs with the gas token"),
    (
        "GS013",
        "the inner call failed; check the target call and the Safe's balance",
    ),
    ("GS020", "signature data too short; collect the missing signatures"),
    ("GS021", "invalid contract signature location: inside static part"),
    ("GS022", "invalid contract signature location: length not present"),
    ("GS023", "invalid contract signature location: data not complete"),
    ("GS024", "invalid contract signature provided"),
    ("GS025", "hash has not been approved by the owner"),
    (
        "GS026",
        "a signature does not belong to a current owner, or signatures are out of order",
    ),
    ("GS030", "only owners can approve a hash"),
    ("GS031", "method can only be called by the Safe itself"),
    ("GS200", "owners have already been set up"),
    ("GS201", "threshold cannot exceed the owner count"),
    ("GS202", "threshold needs to be greater than 0"),
    ("GS203", "invalid owner address provided"),
    ("GS204", "address is already an owner"),
    ("GS205", "invalid previous owner for the owner being removed"),
];

/// Spell out a Safe revert code found in `text` (plain or hex-encoded revert
/// data). Text without a known code is returned unchanged.
pub fn explain_revert(text: &str) -> String {
    match find_safe_code(text) {
        Some((code, meaning)) => format!("{}: {}", code, meaning),
        None => text.to_string(),
    }
}

fn find_safe_code(text: &str) -> Option<(&'static str, &'static str)> {
    let lookup = |haystack: &str| {
        SAFE_ERRORS
            .iter()
            .find(|(code, _)| haystack.contains(code))
            .copied()
    };
    if let Some(found) = lookup(text) {
        return Some(found);
    }
    // Revert data such as Error(string) arrives hex-encoded.
    text.split(|c: char| !c.is_ascii_hexdigit() && c != 'x')
        .filter(|token| token.starts_with("0x") && token.len() > 2)
        .filter_map(|token| hex::decode(token).ok())
        .find_map(|bytes| lookup(String::from_utf8_lossy(&bytes).as_ref()))
}

/// On-chain Safe state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeInfo {
    pub address: Address,
    pub nonce: U256,
    pub owners: Vec<Address>,
    pub threshold: u64,
}

impl SafeInfo {
    pub fn is_owner(&self, address: &Address) -> bool {
        self.owners.contains(address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeTxPhase {
    /// Collecting signatures.
    Signing,
    Submitted,
    Confirmed,
    Failed,
}

/// A proposed Safe transaction waiting for signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafePendingTx {
    pub safe: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: U256,
    pub safe_tx_hash: B256,
    /// Threshold when the transaction was proposed.
    pub threshold: u64,
    /// Owner → 65-byte signature. Ordered by owner address.
    pub signatures: BTreeMap<Address, Bytes>,
    pub summary: String,
    pub phase: SafeTxPhase,
    /// History entry created while queued.
    pub record_id: Option<Uuid>,
}

impl SafePendingTx {
    pub fn is_executable(&self) -> bool {
        self.signatures.len() as u64 >= self.threshold
    }

    /// Signatures concatenated in ascending owner order, as `execTransaction`
    /// verifies them.
    pub fn packed_signatures(&self) -> Bytes {
        let mut packed = Vec::with_capacity(self.signatures.len() * 65);
        for signature in self.signatures.values() {
            packed.extend_from_slice(signature);
        }
        packed.into()
    }
}

/// Local queue of proposed Safe transactions, keyed by Safe transaction hash.
///
/// The caller owns persistence; see [`SafeQueue::export`] and [`SafeQueue::import`].
#[derive(Debug, Clone, Default)]
pub struct SafeQueue {
    inner: Arc<DashMap<B256, SafePendingTx>>,
}

impl SafeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, safe_tx_hash: &B256) -> Option<SafePendingTx> {
        self.inner.get(safe_tx_hash).map(|r| r.value().clone())
    }

    pub fn insert(&self, tx: SafePendingTx) {
        self.inner.insert(tx.safe_tx_hash, tx);
    }

    pub fn remove(&self, safe_tx_hash: &B256) -> Option<SafePendingTx> {
        self.inner.remove(safe_tx_hash).map(|(_, tx)| tx)
    }

    /// Pending transactions of one Safe, lowest nonce first.
    pub fn for_safe(&self, safe: Address) -> Vec<SafePendingTx> {
        let mut txs: Vec<_> = self
            .inner
            .iter()
            .filter(|r| r.value().safe == safe)
            .map(|r| r.value().clone())
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        txs
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn export(&self) -> Vec<SafePendingTx> {
        let mut txs: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        txs.sort_by_key(|tx| (tx.safe, tx.nonce));
        txs
    }

    pub fn import(&self, txs: Vec<SafePendingTx>) {
        for tx in txs {
            self.insert(tx);
        }
    }
}

/// Result of a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// Threshold met on proposal and `execTransaction` was broadcast.
    Executed(SafeExecution),
    /// Waiting for more owners.
    Queued { safe_tx_hash: B256, have: usize, need: u64 },
}

/// A broadcast `execTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeExecution {
    pub safe_tx_hash: B256,
    pub tx_hash: B256,
    pub record_id: Uuid,
    pub phase: SafeTxPhase,
}

pub struct SafeOrchestrator<R> {
    sender: EvmSender<R>,
    queue: SafeQueue,
    log: TransactionLog,
}

impl<R: JsonRpcTransport> SafeOrchestrator<R> {
    pub fn new(sender: EvmSender<R>, queue: SafeQueue, log: TransactionLog) -> Self {
        Self { sender, queue, log }
    }

    pub fn queue(&self) -> &SafeQueue {
        &self.queue
    }

    pub fn sender(&self) -> &EvmSender<R> {
        &self.sender
    }

    fn chain(&self) -> ChainTarget {
        ChainTarget::Evm {
            chain_id: self.sender.chain_id(),
        }
    }

    async fn view(&self, safe: Address, data: Vec<u8>) -> EvmResult<Bytes> {
        Ok(self.sender.rpc().call(safe, &data.into()).await?)
    }

    /// Read nonce, owners and threshold.
    pub async fn info(&self, safe: Address) -> EvmResult<SafeInfo> {
        let (nonce, owners, threshold) = tokio::try_join!(
            self.view(safe, ISafe::nonceCall {}.abi_encode()),
            self.view(safe, ISafe::getOwnersCall {}.abi_encode()),
            self.view(safe, ISafe::getThresholdCall {}.abi_encode()),
        )?;

        let threshold: U256 = decode_return(&threshold, "getThreshold")?;
        Ok(SafeInfo {
            address: safe,
            nonce: decode_return(&nonce, "nonce")?,
            owners: decode_return(&owners, "getOwners")?,
            threshold: threshold.saturating_to(),
        })
    }

    /// `getTransactionHash` for a plain call with no gas refund.
    pub async fn safe_tx_hash(
        &self,
        safe: Address,
        to: Address,
        value: U256,
        data: &Bytes,
        nonce: U256,
    ) -> EvmResult<B256> {
        let call = ISafe::getTransactionHashCall {
            to,
            value,
            data: data.clone(),
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            _nonce: nonce,
        };
        let result = self.view(safe, call.abi_encode()).await?;
        Ok(decode_return(&result, "getTransactionHash")?)
    }

    /// `eth_sign` over the Safe transaction hash with `v` shifted into the
    /// Safe's eth_sign range.
    pub fn sign(&self, key: &SigningKey, safe_tx_hash: &B256) -> EvmResult<Bytes> {
        let mut signature = key.sign_eth_message(safe_tx_hash.as_slice())?;
        if signature[64] < 30 {
            signature[64] += ETH_SIGN_V_OFFSET;
        }
        Ok(Bytes::copy_from_slice(&signature))
    }

    /// Propose a call from `safe`, signed by `key`.
    pub async fn propose(
        &self,
        key: &SigningKey,
        safe: Address,
        to: Address,
        value: U256,
        data: Bytes,
        summary: impl Into<String>,
    ) -> EvmResult<Proposal> {
        let signer = key.evm_address();
        let info = self.info(safe).await?;
        if !info.is_owner(&signer) {
            return Err(EvmError::NotOwner(signer));
        }

        let safe_tx_hash = self.safe_tx_hash(safe, to, value, &data, info.nonce).await?;
        let summary = summary.into();

        if let Some(existing) = self.queue.get(&safe_tx_hash) {
            tracing::debug!(%safe, %safe_tx_hash, "Proposal already queued, adding signature");
            let have = self.insert_signature(key, &safe_tx_hash)?;
            return Ok(Proposal::Queued {
                safe_tx_hash,
                have,
                need: existing.threshold,
            });
        }

        let mut signatures = BTreeMap::new();
        signatures.insert(signer, self.sign(key, &safe_tx_hash)?);

        let mut pending = SafePendingTx {
            safe,
            to,
            value,
            data,
            nonce: info.nonce,
            safe_tx_hash,
            threshold: info.threshold,
            signatures,
            summary,
            phase: SafeTxPhase::Signing,
            record_id: None,
        };

        if pending.is_executable() {
            tracing::info!(%safe, %safe_tx_hash, "Threshold met on proposal, executing");
            let execution = self.submit(key, &pending).await?;
            return Ok(Proposal::Executed(execution));
        }

        let record = TransactionRecord::queued(self.chain(), pending.summary.clone());
        pending.record_id = Some(self.log.push(record));
        let have = pending.signatures.len();
        let need = pending.threshold;
        self.queue.insert(pending);

        tracing::info!(%safe, %safe_tx_hash, have, need, "Safe transaction queued");
        Ok(Proposal::Queued {
            safe_tx_hash,
            have,
            need,
        })
    }

    /// Add `key`'s signature to a queued transaction; a repeat signature is a
    /// no-op. Returns the signature count.
    pub async fn add_signature(&self, key: &SigningKey, safe_tx_hash: &B256) -> EvmResult<usize> {
        let pending = self
            .queue
            .get(safe_tx_hash)
            .ok_or(EvmError::UnknownSafeTx(*safe_tx_hash))?;
        let signer = key.evm_address();
        if !pending.signatures.contains_key(&signer) {
            let info = self.info(pending.safe).await?;
            if !info.is_owner(&signer) {
                return Err(EvmError::NotOwner(signer));
            }
        }
        self.insert_signature(key, safe_tx_hash)
    }

    fn insert_signature(&self, key: &SigningKey, safe_tx_hash: &B256) -> EvmResult<usize> {
        let signer = key.evm_address();
        let signature = self.sign(key, safe_tx_hash)?;
        let mut entry = self
            .queue
            .inner
            .get_mut(safe_tx_hash)
            .ok_or(EvmError::UnknownSafeTx(*safe_tx_hash))?;
        if entry.signatures.contains_key(&signer) {
            return Ok(entry.signatures.len());
        }
        entry.signatures.insert(signer, signature);
        tracing::info!(%signer, %safe_tx_hash, have = entry.signatures.len(), "Signature added");
        Ok(entry.signatures.len())
    }

    /// Execute a queued transaction once enough owners have signed.
    pub async fn execute(&self, key: &SigningKey, safe_tx_hash: &B256) -> EvmResult<SafeExecution> {
        let pending = self
            .queue
            .get(safe_tx_hash)
            .ok_or(EvmError::UnknownSafeTx(*safe_tx_hash))?;
        if !pending.is_executable() {
            return Err(EvmError::BelowThreshold {
                have: pending.signatures.len(),
                threshold: pending.threshold,
            });
        }

        let execution = self.submit(key, &pending).await?;
        self.queue.remove(safe_tx_hash);
        Ok(execution)
    }

    async fn submit(&self, key: &SigningKey, pending: &SafePendingTx) -> EvmResult<SafeExecution> {
        let call = ISafe::execTransactionCall {
            to: pending.to,
            value: pending.value,
            data: pending.data.clone(),
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: pending.packed_signatures(),
        };

        let tx_hash = self
            .sender
            .send_transaction(key, pending.safe, U256::ZERO, call.abi_encode().into())
            .await?;
        let hash = tx_hash.to_string();

        let record_id = match pending.record_id {
            Some(id) if self.log.mark_submitted(&id, hash.clone()).is_ok() => id,
            _ => self.log.push(TransactionRecord::submitted(
                self.chain(),
                hash,
                pending.summary.clone(),
            )),
        };

        tracing::info!(safe = %pending.safe, safe_tx_hash = %pending.safe_tx_hash, %tx_hash, "Safe transaction executed");
        Ok(SafeExecution {
            safe_tx_hash: pending.safe_tx_hash,
            tx_hash,
            record_id,
            phase: SafeTxPhase::Submitted,
        })
    }

    /// Follow an execution to its receipt and record the verdict.
    pub async fn confirm_execution(&self, execution: &mut SafeExecution) -> ConfirmationOutcome {
        let outcome = self.sender.wait_for_receipt(execution.tx_hash).await;
        match &outcome {
            ConfirmationOutcome::Confirmed { .. } => execution.phase = SafeTxPhase::Confirmed,
            ConfirmationOutcome::Failed { .. } => execution.phase = SafeTxPhase::Failed,
            ConfirmationOutcome::Unresolved => {}
        }
        if let Err(err) = self.log.apply_outcome(&execution.record_id, &outcome) {
            tracing::debug!(error = %err, "Execution outcome not recorded");
        }
        outcome
    }

    /// Propose `addOwnerWithThreshold`. `threshold` defaults to the current one.
    pub async fn add_owner(
        &self,
        key: &SigningKey,
        safe: Address,
        owner: Address,
        threshold: Option<u64>,
    ) -> EvmResult<Proposal> {
        let info = self.info(safe).await?;
        if owner == Address::ZERO || owner == SENTINEL_OWNERS || owner == safe {
            return Err(EvmError::InvalidInput(format!("{} cannot be an owner", owner)));
        }
        if info.is_owner(&owner) {
            return Err(EvmError::InvalidInput(format!("{} is already an owner", owner)));
        }
        let threshold = threshold.unwrap_or(info.threshold);
        check_threshold(threshold, info.owners.len() + 1)?;

        let data = ISafe::addOwnerWithThresholdCall {
            owner,
            _threshold: U256::from(threshold),
        }
        .abi_encode();
        self.propose(key, safe, safe, U256::ZERO, data.into(), format!("add owner {}", owner))
            .await
    }

    /// Propose `removeOwner`, lowering the threshold if it would exceed the
    /// remaining owner count.
    pub async fn remove_owner(&self, key: &SigningKey, safe: Address, owner: Address) -> EvmResult<Proposal> {
        let info = self.info(safe).await?;
        let (prev_owner, threshold) = removal_plan(&info, owner)?;

        let data = ISafe::removeOwnerCall {
            prevOwner: prev_owner,
            owner,
            _threshold: U256::from(threshold),
        }
        .abi_encode();
        self.propose(key, safe, safe, U256::ZERO, data.into(), format!("remove owner {}", owner))
            .await
    }

    pub async fn change_threshold(&self, key: &SigningKey, safe: Address, threshold: u64) -> EvmResult<Proposal> {
        let info = self.info(safe).await?;
        check_threshold(threshold, info.owners.len())?;

        let data = ISafe::changeThresholdCall {
            _threshold: U256::from(threshold),
        }
        .abi_encode();
        self.propose(
            key,
            safe,
            safe,
            U256::ZERO,
            data.into(),
            format!("change threshold to {}", threshold),
        )
        .await
    }
}

fn check_threshold(threshold: u64, owners: usize) -> EvmResult<()> {
    if threshold == 0 || threshold > owners as u64 {
        return Err(EvmError::InvalidInput(format!(
            "threshold {} must be between 1 and {}",
            threshold, owners
        )));
    }
    Ok(())
}

/// Previous owner in the linked list and the threshold after removal.
fn removal_plan(info: &SafeInfo, owner: Address) -> EvmResult<(Address, u64)> {
    let index = info
        .owners
        .iter()
        .position(|o| *o == owner)
        .ok_or_else(|| EvmError::InvalidInput(format!("{} is not an owner", owner)))?;
    if info.owners.len() == 1 {
        return Err(EvmError::InvalidInput("cannot remove the last owner".into()));
    }

    let prev_owner = if index == 0 {
        SENTINEL_OWNERS
    } else {
        info.owners[index - 1]
    };
    let remaining = (info.owners.len() - 1) as u64;
    Ok((prev_owner, info.threshold.min(remaining).max(1)))
}
