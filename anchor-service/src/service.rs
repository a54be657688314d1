use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use passport_core::{
    AnchorJob, AnchoringRecord, Digest, DigestKind, PassportId, Record, HASH_ALGORITHM,
};
use passport_metrics::Recorder;

use crate::{
    chain::{AnchorCall, AnchorChain, FeeOverrides},
    metrics::{Metrics, SubmissionEvent},
    store::{AnchoringStore, JobStore},
    verification::{most_recent, LatestAnchor, Verification},
    worker::{BatchReport, ConfirmationWorker, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS},
    Error, Result,
};

/// Whether a submission waits for its receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Wait for one confirmation and write the anchoring state directly.
    Sync,
    /// Persist a pending job and return immediately.
    #[default]
    Async,
}

impl SubmitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitMode::Sync => "sync",
            SubmitMode::Async => "async",
        }
    }
}

/// A request to anchor a record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub record: Record,
    #[serde(default)]
    pub kind: DigestKind,
    pub uri: String,
    pub version: u64,
    #[serde(default)]
    pub mode: SubmitMode,
    #[serde(default)]
    pub fees: FeeOverrides,
}

/// What a submission produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SubmitOutcome {
    /// The transaction was mined successfully.
    #[serde(rename_all = "camelCase")]
    Sync {
        tx_hash: String,
        digest: Digest,
        passport_id: PassportId,
        block_number: u64,
        /// The record already held an equal or newer anchoring version, so it was left as is.
        superseded: bool,
    },
    /// The transaction was broadcast and a pending job was stored.
    #[serde(rename_all = "camelCase")]
    Async {
        tx_hash: String,
        digest: Digest,
        passport_id: PassportId,
    },
}

impl SubmitOutcome {
    pub fn tx_hash(&self) -> &str {
        match self {
            SubmitOutcome::Sync { tx_hash, .. } | SubmitOutcome::Async { tx_hash, .. } => tx_hash,
        }
    }
}

/// Mining state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Pending,
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub confirmed: bool,
    pub status: TxState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Tunables of the anchoring lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Jobs checked per confirmation batch.
    pub batch_size: usize,
    /// Empty receipt checks before a job times out.
    pub max_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// The anchoring operations offered to the application.
pub struct AnchorService {
    chain: Arc<dyn AnchorChain>,
    jobs: Arc<dyn JobStore>,
    anchorings: Arc<dyn AnchoringStore>,
    worker: ConfirmationWorker,
    metrics: Metrics,
}

impl AnchorService {
    pub fn new(
        chain: Arc<dyn AnchorChain>,
        jobs: Arc<dyn JobStore>,
        anchorings: Arc<dyn AnchoringStore>,
        config: ServiceConfig,
        metrics: Metrics,
    ) -> Self {
        let worker = ConfirmationWorker::new(
            chain.clone(),
            jobs.clone(),
            anchorings.clone(),
            config.batch_size,
            config.max_attempts,
            metrics.clone(),
        );
        Self {
            chain,
            jobs,
            anchorings,
            worker,
            metrics,
        }
    }

    /// Digest a record and anchor it.
    ///
    /// The version must be at least 1 and newer than the record's stored anchoring version.
    #[instrument(skip_all, fields(object_id = %request.record.id, version = request.version, mode = request.mode.as_str()))]
    pub async fn submit_anchor(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let mode = request.mode;
        let res = self.submit(request).await;
        let outcome = match &res {
            Ok(SubmitOutcome::Sync {
                superseded: true, ..
            }) => "superseded",
            Ok(SubmitOutcome::Sync { .. }) => "confirmed",
            Ok(SubmitOutcome::Async { .. }) => "submitted",
            Err(err) => err.kind(),
        };
        self.metrics.record(&SubmissionEvent {
            mode: mode.as_str(),
            outcome,
        });
        res
    }

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let SubmitRequest {
            record,
            kind,
            uri,
            version,
            mode,
            fees,
        } = request;
        if record.id.is_empty() {
            return Err(Error::InvalidArgument("record id is empty".to_owned()));
        }
        if version == 0 {
            return Err(Error::InvalidArgument(
                "version must be a positive integer".to_owned(),
            ));
        }
        if let Some(stored) = self.anchorings.get_anchoring(&record.id).await? {
            if !stored.accepts_version(version) {
                return Err(Error::InvalidArgument(format!(
                    "version {version} is not newer than anchored version {}",
                    stored.version
                )));
            }
        }

        let digest = kind.digest(&record);
        let passport_id = PassportId::from_record_id(&record.id);
        let call = AnchorCall {
            passport_id,
            digest,
            algo: HASH_ALGORITHM.to_owned(),
            uri: uri.clone(),
            version,
            fees,
        };
        let tx_hash = self.chain.submit(&call).await?;
        info!(%tx_hash, %digest, %kind, "anchor transaction broadcast");

        match mode {
            SubmitMode::Async => {
                let job = AnchorJob::pending(
                    &record.id,
                    &tx_hash,
                    digest,
                    kind,
                    HASH_ALGORITHM,
                    version,
                    uri,
                    Utc::now(),
                );
                if let Err(err) = self.jobs.insert_job(&job).await {
                    // The transaction is already broadcast and cannot be retracted.
                    error!(%tx_hash, %err, "failed to persist anchor job");
                    return Err(err);
                }
                Ok(SubmitOutcome::Async {
                    tx_hash,
                    digest,
                    passport_id,
                })
            }
            SubmitMode::Sync => {
                let receipt = self.chain.wait_for_receipt(&tx_hash).await?;
                if !receipt.success {
                    return Err(Error::OnChainFailure {
                        tx_hash,
                        detail: format!("reverted in block {}", receipt.block_number),
                    });
                }
                let anchored_at = self
                    .chain
                    .block_timestamp(receipt.block_number)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(Utc::now);
                let anchoring = AnchoringRecord {
                    is_anchored: true,
                    tx_hash: tx_hash.clone(),
                    digest,
                    version,
                    anchored_at,
                    uri,
                    block_number: receipt.block_number,
                };
                let applied = self
                    .anchorings
                    .apply_anchoring(&record.id, &anchoring)
                    .await?;
                info!(%tx_hash, block = receipt.block_number, applied, "anchor confirmed");
                Ok(SubmitOutcome::Sync {
                    tx_hash,
                    digest,
                    passport_id,
                    block_number: receipt.block_number,
                    superseded: !applied,
                })
            }
        }
    }

    /// Check one batch of pending jobs against the chain.
    pub async fn run_confirmation_batch(&self) -> Result<BatchReport> {
        self.worker.run_batch().await
    }

    /// Whether the record's current digest of `kind` is anchored.
    pub async fn verify_anchor(&self, record: &Record, kind: DigestKind) -> Result<Verification> {
        self.is_anchored(&record.id, Some(&kind.digest(record)))
            .await
    }

    /// Whether the record has any anchor, or an anchor of `digest` when given.
    #[instrument(skip(self))]
    pub async fn is_anchored(&self, object_id: &str, digest: Option<&Digest>) -> Result<Verification> {
        let events = self.events(object_id).await?;
        Ok(most_recent(&events, digest).into())
    }

    /// The most recent anchor event for the record regardless of digest.
    pub async fn latest_anchor_event(&self, record: &Record) -> Result<Option<LatestAnchor>> {
        let events = self.events(&record.id).await?;
        Ok(most_recent(&events, None).cloned().map(LatestAnchor::from))
    }

    /// Mining state of any transaction.
    #[instrument(skip(self))]
    pub async fn get_transaction_status(&self, tx_hash: &str) -> Result<TransactionStatus> {
        Ok(match self.chain.receipt(tx_hash).await? {
            None => TransactionStatus {
                confirmed: false,
                status: TxState::Pending,
                block_number: None,
            },
            Some(receipt) => TransactionStatus {
                confirmed: receipt.success,
                status: if receipt.success {
                    TxState::Success
                } else {
                    TxState::Reverted
                },
                block_number: Some(receipt.block_number),
            },
        })
    }

    /// Stored anchoring state of a record.
    pub async fn get_anchoring(&self, object_id: &str) -> Result<Option<AnchoringRecord>> {
        self.anchorings.get_anchoring(object_id).await
    }

    /// Stored job for a transaction.
    pub async fn get_job(&self, tx_hash: &str) -> Result<Option<AnchorJob>> {
        self.jobs.get_job(tx_hash).await
    }

    async fn events(&self, object_id: &str) -> Result<Vec<crate::AnchorEvent>> {
        self.chain
            .anchor_events(&PassportId::from_record_id(object_id))
            .await
            .map_err(|err| match err {
                Error::Network(e) => Error::Verification(e),
                other => other,
            })
    }
}
