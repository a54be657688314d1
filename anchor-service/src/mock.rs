//! In-memory implementations of the chain and stores for tests and local tooling.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use passport_core::{AnchorJob, AnchoringRecord, JobStatus, PassportId};

use crate::{
    chain::{AnchorCall, AnchorChain, AnchorEvent, TxReceipt},
    store::{missed_poll_error, AnchoringStore, JobStore},
    Error, Result,
};

/// Unix time of block zero on the mock chain. Blocks are one second apart.
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

#[derive(Debug, Default)]
struct ChainState {
    next_tx: u64,
    calls: HashMap<String, AnchorCall>,
    receipts: HashMap<String, TxReceipt>,
    events: Vec<AnchorEvent>,
    broken_receipts: HashSet<String>,
    rejected_receipts: HashSet<String>,
    submit_error: Option<String>,
    mine_on_submit: Option<(u64, bool)>,
}

impl ChainState {
    fn mine(&mut self, tx_hash: &str, block_number: u64, success: bool) {
        self.receipts.insert(
            tx_hash.to_owned(),
            TxReceipt {
                tx_hash: tx_hash.to_owned(),
                success,
                block_number,
            },
        );
        if success {
            if let Some(call) = self.calls.get(tx_hash).cloned() {
                let log_index = self
                    .events
                    .iter()
                    .filter(|e| e.block_number == block_number)
                    .count() as u64;
                self.events.push(AnchorEvent {
                    passport_id: call.passport_id,
                    digest: call.digest,
                    algo: call.algo,
                    uri: call.uri,
                    version: call.version,
                    tx_hash: tx_hash.to_owned(),
                    block_number,
                    log_index,
                });
            }
        }
    }
}

/// A chain whose transactions are mined only when a test says so.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mine a submitted transaction in `block_number`. A successful transaction emits its
    /// `Anchored` event.
    pub fn mine(&self, tx_hash: &str, block_number: u64, success: bool) {
        self.state
            .lock()
            .expect("mock chain lock poisoned")
            .mine(tx_hash, block_number, success);
    }

    /// Mine every following submission immediately in `block_number`.
    pub fn mine_on_submit(&self, block_number: u64, success: bool) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        state.mine_on_submit = Some((block_number, success));
    }

    /// Make receipt lookups for the transaction fail with a network error.
    pub fn break_receipts(&self, tx_hash: &str) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        state.broken_receipts.insert(tx_hash.to_owned());
    }

    /// Make receipt lookups for the transaction fail with an error retrying cannot fix.
    pub fn reject_receipts(&self, tx_hash: &str) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        state.rejected_receipts.insert(tx_hash.to_owned());
    }

    /// Make every following submission fail with the given node error text.
    pub fn reject_submissions(&self, message: &str) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        state.submit_error = Some(message.to_owned());
    }

    /// Calls submitted so far, keyed by transaction hash.
    pub fn submitted(&self) -> HashMap<String, AnchorCall> {
        self.state
            .lock()
            .expect("mock chain lock poisoned")
            .calls
            .clone()
    }
}

#[async_trait]
impl AnchorChain for MockChain {
    async fn submit(&self, call: &AnchorCall) -> Result<String> {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        if let Some(message) = &state.submit_error {
            return Err(Error::submission(message));
        }
        state.next_tx += 1;
        let tx_hash = format!("0x{:064x}", state.next_tx);
        state.calls.insert(tx_hash.clone(), call.clone());
        if let Some((block_number, success)) = state.mine_on_submit {
            state.mine(&tx_hash, block_number, success);
        }
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt> {
        self.receipt(tx_hash)
            .await?
            .ok_or_else(|| Error::ConfirmationTimeout {
                tx_hash: tx_hash.to_owned(),
                detail: "transaction was not mined".to_owned(),
            })
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>> {
        let state = self.state.lock().expect("mock chain lock poisoned");
        if state.broken_receipts.contains(tx_hash) {
            return Err(Error::Network(anyhow::anyhow!(
                "connection reset fetching receipt for {tx_hash}"
            )));
        }
        if state.rejected_receipts.contains(tx_hash) {
            return Err(Error::InvalidArgument(format!(
                "node cannot look up transaction {tx_hash}"
            )));
        }
        Ok(state.receipts.get(tx_hash).cloned())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(i64::try_from(block_number)
            .ok()
            .and_then(|n| DateTime::from_timestamp(GENESIS_TIMESTAMP + n, 0)))
    }

    async fn anchor_events(&self, passport_id: &PassportId) -> Result<Vec<AnchorEvent>> {
        let state = self.state.lock().expect("mock chain lock poisoned");
        Ok(state
            .events
            .iter()
            .filter(|e| &e.passport_id == passport_id)
            .cloned()
            .collect())
    }
}

/// Jobs kept in a map, with the same pending-only transition rules as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<BTreeMap<String, AnchorJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job.
    pub fn all(&self) -> Vec<AnchorJob> {
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &AnchorJob) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        if jobs.contains_key(&job.tx_hash) {
            return Err(Error::Store(anyhow::anyhow!(
                "job {} already exists",
                job.tx_hash
            )));
        }
        jobs.insert(job.tx_hash.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, tx_hash: &str) -> Result<Option<AnchorJob>> {
        Ok(self
            .jobs
            .lock()
            .expect("job store lock poisoned")
            .get(tx_hash)
            .cloned())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<AnchorJob>> {
        let jobs = self.jobs.lock().expect("job store lock poisoned");
        let mut pending: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tx_hash.cmp(&b.tx_hash))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn record_missed_poll(
        &self,
        tx_hash: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<AnchorJob>> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        let Some(job) = jobs
            .get_mut(tx_hash)
            .filter(|j| j.status == JobStatus::Pending)
        else {
            return Ok(None);
        };
        job.attempts += 1;
        job.last_checked_at = Some(now);
        job.updated_at = now;
        if job.attempts >= max_attempts {
            job.status = JobStatus::Timeout;
            job.error = Some(missed_poll_error(max_attempts));
        }
        Ok(Some(job.clone()))
    }

    async fn finalize(
        &self,
        tx_hash: &str,
        status: JobStatus,
        block_number: Option<u64>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !JobStatus::Pending.can_transition_to(status) {
            return Err(Error::InvalidArgument(format!(
                "{status} is not a terminal job status"
            )));
        }
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        match jobs.get_mut(tx_hash) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = status;
                job.block_number = block_number.or(job.block_number);
                job.error = error;
                job.last_checked_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Anchoring state kept in a map, with the same compare and swap rule as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryAnchoringStore {
    records: Mutex<HashMap<String, AnchoringRecord>>,
}

impl InMemoryAnchoringStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchoringStore for InMemoryAnchoringStore {
    async fn get_anchoring(&self, object_id: &str) -> Result<Option<AnchoringRecord>> {
        Ok(self
            .records
            .lock()
            .expect("anchoring store lock poisoned")
            .get(object_id)
            .cloned())
    }

    async fn apply_anchoring(&self, object_id: &str, record: &AnchoringRecord) -> Result<bool> {
        let mut records = self.records.lock().expect("anchoring store lock poisoned");
        let accepted = match records.get(object_id) {
            None => true,
            Some(stored) => {
                stored.accepts_version(record.version) || stored.tx_hash == record.tx_hash
            }
        };
        if accepted {
            records.insert(object_id.to_owned(), record.clone());
        }
        Ok(accepted)
    }
}
