use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use passport_core::{AnchorJob, AnchoringRecord, JobStatus};
use passport_metrics::Recorder;

use crate::{
    chain::AnchorChain,
    metrics::{BatchEvent, Metrics},
    store::{AnchoringStore, JobStore},
    Result,
};

/// Default number of jobs checked per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Default number of empty receipt checks before a job times out.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// What a batch did to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    /// Mined successfully and the record's anchoring state was written.
    Confirmed,
    /// Reverted, or checking the job hit an error that retrying cannot fix.
    Failed,
    /// No receipt yet, or the check will be retried.
    Pending,
    /// No receipt after the maximum number of checks.
    Timeout,
    /// Mined successfully but the record already holds an equal or newer version.
    Superseded,
    /// Another worker moved the job first.
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Confirmed => "confirmed",
            JobOutcome::Failed => "failed",
            JobOutcome::Pending => "pending",
            JobOutcome::Timeout => "timeout",
            JobOutcome::Superseded => "superseded",
            JobOutcome::Skipped => "skipped",
        }
    }
}

impl From<JobStatus> for JobOutcome {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => JobOutcome::Pending,
            JobStatus::Confirmed => JobOutcome::Confirmed,
            JobStatus::Failed => JobOutcome::Failed,
            JobStatus::Timeout => JobOutcome::Timeout,
            JobStatus::Superseded => JobOutcome::Superseded,
        }
    }
}

/// Result of checking one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub tx_hash: String,
    pub object_id: String,
    pub outcome: JobOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    fn new(job: &AnchorJob, outcome: JobOutcome) -> Self {
        Self {
            tx_hash: job.tx_hash.clone(),
            object_id: job.object_id.clone(),
            outcome,
            attempts: job.attempts,
            block_number: None,
            error: None,
        }
    }

    fn with_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Summary of one confirmation batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed_count: usize,
    pub results: Vec<JobResult>,
}

/// Polls pending jobs against the chain and finalizes them.
///
/// A batch is a single bounded pass. It holds no state between invocations and may run
/// concurrently with itself and with new submissions.
pub struct ConfirmationWorker {
    chain: Arc<dyn AnchorChain>,
    jobs: Arc<dyn JobStore>,
    anchorings: Arc<dyn AnchoringStore>,
    batch_size: usize,
    max_attempts: u32,
    metrics: Metrics,
}

impl ConfirmationWorker {
    pub fn new(
        chain: Arc<dyn AnchorChain>,
        jobs: Arc<dyn JobStore>,
        anchorings: Arc<dyn AnchoringStore>,
        batch_size: usize,
        max_attempts: u32,
        metrics: Metrics,
    ) -> Self {
        Self {
            chain,
            jobs,
            anchorings,
            batch_size,
            max_attempts,
            metrics,
        }
    }

    /// Check up to one batch of pending jobs.
    ///
    /// Errors only when the pending jobs cannot be listed. Failures checking a single job do not
    /// stop the batch. A retryable failure counts as a check without a receipt, any other failure
    /// fails the job.
    #[instrument(skip(self))]
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let pending = self.jobs.pending_jobs(self.batch_size).await?;
        let mut results = Vec::with_capacity(pending.len());
        for job in &pending {
            let result = match self.check_job(job).await {
                Ok(result) => result,
                Err(err) if err.is_retryable() => self.retry_later(job, err.to_string()).await,
                Err(err) => self.fail_job(job, err.to_string()).await,
            };
            self.metrics.record(&result.outcome);
            results.push(result);
        }
        self.metrics.record(&BatchEvent {
            duration: start.elapsed(),
        });
        if !results.is_empty() {
            info!(processed = results.len(), "confirmation batch finished");
        }
        Ok(BatchReport {
            processed_count: results.len(),
            results,
        })
    }

    #[instrument(skip_all, fields(tx_hash = %job.tx_hash, object_id = %job.object_id))]
    async fn check_job(&self, job: &AnchorJob) -> Result<JobResult> {
        let now = Utc::now();
        let Some(receipt) = self.chain.receipt(&job.tx_hash).await? else {
            return Ok(
                match self
                    .jobs
                    .record_missed_poll(&job.tx_hash, self.max_attempts, now)
                    .await?
                {
                    None => JobResult::new(job, JobOutcome::Skipped),
                    Some(updated) => {
                        if updated.status == JobStatus::Timeout {
                            info!(attempts = updated.attempts, "anchor job timed out");
                        } else {
                            debug!(attempts = updated.attempts, "no receipt yet");
                        }
                        let mut result = JobResult::new(&updated, updated.status.into());
                        result.error = updated.error;
                        result
                    }
                },
            );
        };

        if !receipt.success {
            let error = "transaction reverted".to_owned();
            let moved = self
                .jobs
                .finalize(
                    &job.tx_hash,
                    JobStatus::Failed,
                    Some(receipt.block_number),
                    Some(error.clone()),
                    now,
                )
                .await?;
            return Ok(if moved {
                info!(block = receipt.block_number, "anchor transaction reverted");
                JobResult::new(job, JobOutcome::Failed)
                    .with_block(receipt.block_number)
                    .with_error(error)
            } else {
                JobResult::new(job, JobOutcome::Skipped)
            });
        }

        let anchored_at = match self.chain.block_timestamp(receipt.block_number).await {
            Ok(Some(ts)) => ts,
            Ok(None) => now,
            Err(err) => {
                warn!(%err, block = receipt.block_number, "block lookup failed, using current time");
                now
            }
        };
        let record = AnchoringRecord::from_job(job, receipt.block_number, anchored_at);
        let applied = self
            .anchorings
            .apply_anchoring(&job.object_id, &record)
            .await?;
        let (status, error) = if applied {
            (JobStatus::Confirmed, None)
        } else {
            (
                JobStatus::Superseded,
                Some(format!(
                    "record already anchored at version {} or newer",
                    job.version
                )),
            )
        };
        let moved = self
            .jobs
            .finalize(
                &job.tx_hash,
                status,
                Some(receipt.block_number),
                error.clone(),
                now,
            )
            .await?;
        if !moved {
            return Ok(JobResult::new(job, JobOutcome::Skipped));
        }
        info!(block = receipt.block_number, %status, version = job.version, "anchor job finalized");
        let result = JobResult::new(job, status.into()).with_block(receipt.block_number);
        Ok(match error {
            Some(error) => result.with_error(error),
            None => result,
        })
    }

    async fn retry_later(&self, job: &AnchorJob, error: String) -> JobResult {
        warn!(tx_hash = %job.tx_hash, %error, "checking anchor job failed, will retry");
        match self
            .jobs
            .record_missed_poll(&job.tx_hash, self.max_attempts, Utc::now())
            .await
        {
            Ok(Some(updated)) => {
                JobResult::new(&updated, updated.status.into()).with_error(error)
            }
            Ok(None) => JobResult::new(job, JobOutcome::Skipped),
            Err(store_err) => {
                warn!(tx_hash = %job.tx_hash, %store_err, "recording missed check failed");
                JobResult::new(job, JobOutcome::Pending).with_error(error)
            }
        }
    }

    async fn fail_job(&self, job: &AnchorJob, error: String) -> JobResult {
        warn!(tx_hash = %job.tx_hash, %error, "checking anchor job failed");
        match self
            .jobs
            .finalize(
                &job.tx_hash,
                JobStatus::Failed,
                None,
                Some(error.clone()),
                Utc::now(),
            )
            .await
        {
            Ok(true) => JobResult::new(job, JobOutcome::Failed).with_error(error),
            Ok(false) => JobResult::new(job, JobOutcome::Skipped),
            Err(store_err) => {
                warn!(tx_hash = %job.tx_hash, %store_err, "recording job failure failed");
                JobResult::new(job, JobOutcome::Failed).with_error(error)
            }
        }
    }
}
