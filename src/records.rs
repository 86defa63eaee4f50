//! Transaction history and confirmation outcomes.
//!
//! Records are created at submit and only move forward: once a record is
//! confirmed or failed it is frozen.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which chain a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainTarget {
    Tron,
    Evm { chain_id: u64 },
}

impl std::fmt::Display for ChainTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainTarget::Tron => write!(f, "tron"),
            ChainTarget::Evm { chain_id } => write!(f, "evm:{}", chain_id),
        }
    }
}

/// Result of waiting on a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConfirmationOutcome {
    Confirmed { block_number: Option<u64> },
    Failed { reason: String },
    /// Neither outcome observed before the deadline.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Waiting for more signatures.
    Queued,
    Submitted,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

/// One entry in the wallet's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub chain: ChainTarget,
    pub hash: Option<String>,
    pub status: TxStatus,
    /// Seconds since epoch.
    pub timestamp: u64,
    pub summary: String,
    pub error: Option<String>,
}

impl TransactionRecord {
    fn new(chain: ChainTarget, hash: Option<String>, status: TxStatus, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain,
            hash,
            status,
            timestamp: now_secs(),
            summary,
            error: None,
        }
    }

    pub fn submitted(chain: ChainTarget, hash: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::new(chain, Some(hash.into()), TxStatus::Submitted, summary.into())
    }

    pub fn queued(chain: ChainTarget, summary: impl Into<String>) -> Self {
        Self::new(chain, None, TxStatus::Queued, summary.into())
    }

    pub fn failed(chain: ChainTarget, summary: impl Into<String>, error: impl Into<String>) -> Self {
        let mut record = Self::new(chain, None, TxStatus::Failed, summary.into());
        record.error = Some(error.into());
        record
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("no transaction record {0}")]
    NotFound(Uuid),

    #[error("transaction record {0} is already final")]
    AlreadyFinal(Uuid),

    #[error("transaction record {0} is not waiting for signatures")]
    NotQueued(Uuid),
}

/// Thread-safe transaction history.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    inner: Arc<DashMap<Uuid, TransactionRecord>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: TransactionRecord) -> Uuid {
        let id = record.id;
        self.inner.insert(id, record);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<TransactionRecord> {
        self.inner.get(id).map(|r| r.value().clone())
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<TransactionRecord> {
        self.inner
            .iter()
            .find(|r| r.value().hash.as_deref() == Some(hash))
            .map(|r| r.value().clone())
    }

    /// Newest first.
    pub fn list(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Submitted records still waiting on a verdict.
    pub fn pending(&self) -> Vec<TransactionRecord> {
        self.inner
            .iter()
            .filter(|r| r.value().status == TxStatus::Submitted && r.value().hash.is_some())
            .map(|r| r.value().clone())
            .collect()
    }

    /// Move a record forward; final records reject every update.
    pub fn update_status(
        &self,
        id: &Uuid,
        status: TxStatus,
        error: Option<String>,
    ) -> Result<(), RecordError> {
        let mut entry = self.inner.get_mut(id).ok_or(RecordError::NotFound(*id))?;
        if entry.status.is_terminal() {
            return Err(RecordError::AlreadyFinal(*id));
        }
        entry.status = status;
        if error.is_some() {
            entry.error = error;
        }
        Ok(())
    }

    /// A queued record got its on-chain hash.
    pub fn mark_submitted(&self, id: &Uuid, hash: impl Into<String>) -> Result<(), RecordError> {
        let mut entry = self.inner.get_mut(id).ok_or(RecordError::NotFound(*id))?;
        if entry.status != TxStatus::Queued {
            return Err(RecordError::NotQueued(*id));
        }
        entry.status = TxStatus::Submitted;
        entry.hash = Some(hash.into());
        Ok(())
    }

    /// Apply a confirmation outcome; unresolved leaves the record as is.
    pub fn apply_outcome(&self, id: &Uuid, outcome: &ConfirmationOutcome) -> Result<(), RecordError> {
        match outcome {
            ConfirmationOutcome::Confirmed { .. } => self.update_status(id, TxStatus::Confirmed, None),
            ConfirmationOutcome::Failed { reason } => {
                self.update_status(id, TxStatus::Failed, Some(reason.clone()))
            }
            ConfirmationOutcome::Unresolved => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn export(&self) -> Vec<TransactionRecord> {
        self.list()
    }

    /// Merge records; existing final records are kept over imported ones.
    pub fn import(&self, records: Vec<TransactionRecord>) {
        for record in records {
            let keep_existing = self
                .inner
                .get(&record.id)
                .map(|r| r.value().status.is_terminal())
                .unwrap_or(false);
            if !keep_existing {
                self.inner.insert(record.id, record);
            }
        }
    }

    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        let log = Self::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let records: Vec<TransactionRecord> = serde_json::from_reader(reader)?;
            log.import(records);
            tracing::info!("Loaded {} transaction records", log.len());
        }
        Ok(log)
    }

    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        let records = self.export();
        serde_json::to_writer_pretty(writer, &records)?;
        tracing::info!("Saved {} transaction records", records.len());
        Ok(())
    }

    /// Count by status.
    pub fn summary(&self) -> HashMap<TxStatus, usize> {
        let mut counts = HashMap::new();
        for r in self.inner.iter() {
            *counts.entry(r.value().status).or_insert(0) += 1;
        }
        counts
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
