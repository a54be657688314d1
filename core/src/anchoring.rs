use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Digest, DigestKind};

/// Lifecycle of an asynchronous anchor job.
///
/// Jobs start `Pending` and move to exactly one terminal status. No transition leaves a terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, waiting for a receipt.
    Pending,
    /// Mined successfully and applied to the record.
    Confirmed,
    /// Reverted on-chain or errored while checking.
    Failed,
    /// No receipt after the maximum number of checks.
    Timeout,
    /// Mined successfully but a newer version was already applied to the record.
    Superseded,
}

impl JobStatus {
    /// All statuses other than `Pending` are terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }

    /// Whether a job in this status may move to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == JobStatus::Pending && next.is_terminal()
    }

    /// Lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Confirmed => "confirmed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Superseded => "superseded",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "superseded" => Ok(Self::Superseded),
            v => anyhow::bail!("unknown job status: {}", v),
        }
    }
}

/// A submitted anchor transaction tracked until it confirms, fails or times out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorJob {
    /// Record the anchor belongs to.
    pub object_id: String,
    /// Transaction hash, `0x` prefixed lowercase hex. Identifies the job.
    pub tx_hash: String,
    /// Anchored digest.
    pub digest: Digest,
    /// Field set the digest covers.
    pub kind: DigestKind,
    /// Hash algorithm label sent on-chain.
    pub algo: String,
    /// Anchor version for the record.
    pub version: u64,
    /// Off-chain locator of the anchored content.
    pub uri: String,
    /// Current status.
    pub status: JobStatus,
    /// Number of checks that found no receipt.
    pub attempts: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job last changed.
    pub updated_at: DateTime<Utc>,
    /// When the job was last checked against the chain.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Block the transaction was mined in.
    pub block_number: Option<u64>,
    /// Failure detail.
    pub error: Option<String>,
}

impl AnchorJob {
    /// A freshly submitted job.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        object_id: impl Into<String>,
        tx_hash: impl Into<String>,
        digest: Digest,
        kind: DigestKind,
        algo: impl Into<String>,
        version: u64,
        uri: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            tx_hash: tx_hash.into(),
            digest,
            kind,
            algo: algo.into(),
            version,
            uri: uri.into(),
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
            block_number: None,
            error: None,
        }
    }
}

/// Anchoring state embedded on a record once one of its anchors has confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchoringRecord {
    /// Always true for a stored record; absent state is reported as not anchored.
    pub is_anchored: bool,
    /// Transaction that carried the anchor.
    pub tx_hash: String,
    /// Anchored digest.
    pub digest: Digest,
    /// Anchor version. Never decreases for a record.
    pub version: u64,
    /// Block timestamp of the anchor, or the time it was observed.
    pub anchored_at: DateTime<Utc>,
    /// Off-chain locator of the anchored content.
    pub uri: String,
    /// Block the transaction was mined in.
    pub block_number: u64,
}

impl AnchoringRecord {
    /// Anchoring state for a confirmed job.
    pub fn from_job(job: &AnchorJob, block_number: u64, anchored_at: DateTime<Utc>) -> Self {
        Self {
            is_anchored: true,
            tx_hash: job.tx_hash.clone(),
            digest: job.digest,
            version: job.version,
            anchored_at,
            uri: job.uri.clone(),
            block_number,
        }
    }

    /// Whether a job with `version` may replace this state.
    pub fn accepts_version(&self, version: u64) -> bool {
        version > self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_transitions() {
        use JobStatus::*;
        for next in [Confirmed, Failed, Timeout, Superseded] {
            assert!(Pending.can_transition_to(next));
            for terminal in [Confirmed, Failed, Timeout, Superseded] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Confirmed,
            JobStatus::Failed,
            JobStatus::Timeout,
            JobStatus::Superseded,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
    }

    #[test]
    fn new_jobs_are_pending() {
        let now = Utc::now();
        let job = AnchorJob::pending(
            "obj1",
            "0xabc",
            Digest::keccak(b"obj1"),
            DigestKind::Core,
            crate::HASH_ALGORITHM,
            1,
            "ipfs://obj1",
            now,
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.last_checked_at.is_none());

        let anchoring = AnchoringRecord::from_job(&job, 1000, now);
        assert!(anchoring.is_anchored);
        assert!(anchoring.accepts_version(2));
        assert!(!anchoring.accepts_version(1));
    }
}
