use async_trait::async_trait;
use chrono::{DateTime, Utc};

use passport_core::{AnchorJob, AnchoringRecord, JobStatus};

use crate::Result;

/// Persistence for asynchronous anchor jobs.
///
/// Every transition is conditional on the job still being pending so that concurrent workers
/// never overwrite a terminal status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly submitted job. Fails if a job with the same transaction hash exists.
    async fn insert_job(&self, job: &AnchorJob) -> Result<()>;

    /// Look up a job by transaction hash.
    async fn get_job(&self, tx_hash: &str) -> Result<Option<AnchorJob>>;

    /// Up to `limit` pending jobs, oldest first.
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<AnchorJob>>;

    /// Atomically count a check that found no receipt. The job moves to `timeout` when the count
    /// reaches `max_attempts`.
    ///
    /// Returns the updated job, or `None` if the job was no longer pending.
    async fn record_missed_poll(
        &self,
        tx_hash: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<AnchorJob>>;

    /// Move a pending job to a terminal status. Returns false if the job was no longer pending.
    async fn finalize(
        &self,
        tx_hash: &str,
        status: JobStatus,
        block_number: Option<u64>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Persistence for the anchoring state of records.
#[async_trait]
pub trait AnchoringStore: Send + Sync {
    async fn get_anchoring(&self, object_id: &str) -> Result<Option<AnchoringRecord>>;

    /// Compare and swap the anchoring state of a record.
    ///
    /// The write is applied when no state exists, when `record.version` is strictly greater than
    /// the stored version, or when the stored state was written by the same transaction.
    /// Returns false, leaving the stored state untouched, otherwise.
    async fn apply_anchoring(&self, object_id: &str, record: &AnchoringRecord) -> Result<bool>;
}

pub(crate) fn missed_poll_error(max_attempts: u32) -> String {
    format!("no receipt after {max_attempts} checks")
}
