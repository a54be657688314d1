use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use passport_core::{AnchorJob, AnchoringRecord, JobStatus};
use passport_sql::sqlite::SqlitePool;

use crate::{
    store::{missed_poll_error, AnchoringStore, JobStore},
    Error, Result,
};

const JOB_COLUMNS: &str = "tx_hash, object_id, digest, kind, algo, version, uri, status, attempts, \
     created_at, updated_at, last_checked_at, block_number, error";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    tx_hash: String,
    object_id: String,
    digest: String,
    kind: String,
    algo: String,
    version: i64,
    uri: String,
    status: String,
    attempts: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_checked_at: Option<DateTime<Utc>>,
    block_number: Option<i64>,
    error: Option<String>,
}

impl TryFrom<JobRow> for AnchorJob {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let decode = |e: anyhow::Error| Error::Store(e.context(format!("job {}", row.tx_hash)));
        Ok(AnchorJob {
            digest: row.digest.parse().map_err(decode)?,
            kind: row.kind.parse().map_err(decode)?,
            status: row.status.parse().map_err(decode)?,
            version: u64::try_from(row.version)
                .map_err(|e| decode(anyhow!(e).context("version")))?,
            attempts: u32::try_from(row.attempts)
                .map_err(|e| decode(anyhow!(e).context("attempts")))?,
            block_number: row
                .block_number
                .map(u64::try_from)
                .transpose()
                .map_err(|e| decode(anyhow!(e).context("block_number")))?,
            object_id: row.object_id,
            algo: row.algo,
            uri: row.uri,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_checked_at: row.last_checked_at,
            error: row.error,
            tx_hash: row.tx_hash,
        })
    }
}

/// Anchor jobs stored in the `passport_anchor_job` table.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &AnchorJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO passport_anchor_job (tx_hash, object_id, digest, kind, algo, version, uri, \
             status, attempts, created_at, updated_at, last_checked_at, block_number, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&job.tx_hash)
        .bind(&job.object_id)
        .bind(job.digest.to_hex())
        .bind(job.kind.as_str())
        .bind(&job.algo)
        .bind(to_i64(job.version)?)
        .bind(&job.uri)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_checked_at)
        .bind(job.block_number.map(to_i64).transpose()?)
        .bind(&job.error)
        .execute(self.pool.writer())
        .await?;
        Ok(())
    }

    async fn get_job(&self, tx_hash: &str) -> Result<Option<AnchorJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM passport_anchor_job WHERE tx_hash = $1"
        ))
        .bind(tx_hash)
        .fetch_optional(self.pool.reader())
        .await?;
        row.map(AnchorJob::try_from).transpose()
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<AnchorJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM passport_anchor_job WHERE status = 'pending' \
             ORDER BY created_at, tx_hash LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool.reader())
        .await?;
        rows.into_iter().map(AnchorJob::try_from).collect()
    }

    async fn record_missed_poll(
        &self,
        tx_hash: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<AnchorJob>> {
        // Right hand sides of SET see the row as it was before the update.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE passport_anchor_job SET \
                attempts = attempts + 1, \
                last_checked_at = $2, \
                updated_at = $2, \
                status = CASE WHEN attempts + 1 >= $3 THEN 'timeout' ELSE status END, \
                error = CASE WHEN attempts + 1 >= $3 THEN $4 ELSE error END \
             WHERE tx_hash = $1 AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(tx_hash)
        .bind(now)
        .bind(i64::from(max_attempts))
        .bind(missed_poll_error(max_attempts))
        .fetch_optional(self.pool.writer())
        .await?;
        row.map(AnchorJob::try_from).transpose()
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
        let res = sqlx::query(
            "UPDATE passport_anchor_job SET \
                status = $2, \
                block_number = COALESCE($3, block_number), \
                error = $4, \
                last_checked_at = $5, \
                updated_at = $5 \
             WHERE tx_hash = $1 AND status = 'pending'",
        )
        .bind(tx_hash)
        .bind(status.as_str())
        .bind(block_number.map(to_i64).transpose()?)
        .bind(error)
        .bind(now)
        .execute(self.pool.writer())
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AnchoringRow {
    tx_hash: String,
    digest: String,
    version: i64,
    anchored_at: DateTime<Utc>,
    uri: String,
    block_number: i64,
}

impl TryFrom<AnchoringRow> for AnchoringRecord {
    type Error = Error;

    fn try_from(row: AnchoringRow) -> Result<Self> {
        Ok(AnchoringRecord {
            is_anchored: true,
            digest: row.digest.parse().map_err(Error::Store)?,
            version: u64::try_from(row.version)
                .context("version")
                .map_err(Error::Store)?,
            block_number: u64::try_from(row.block_number)
                .context("block_number")
                .map_err(Error::Store)?,
            anchored_at: row.anchored_at,
            uri: row.uri,
            tx_hash: row.tx_hash,
        })
    }
}

/// Record anchoring state stored in the `passport_anchoring` table.
#[derive(Debug, Clone)]
pub struct SqliteAnchoringStore {
    pool: SqlitePool,
}

impl SqliteAnchoringStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnchoringStore for SqliteAnchoringStore {
    async fn get_anchoring(&self, object_id: &str) -> Result<Option<AnchoringRecord>> {
        let row: Option<AnchoringRow> = sqlx::query_as(
            "SELECT tx_hash, digest, version, anchored_at, uri, block_number \
             FROM passport_anchoring WHERE object_id = $1",
        )
        .bind(object_id)
        .fetch_optional(self.pool.reader())
        .await?;
        row.map(AnchoringRecord::try_from).transpose()
    }

    async fn apply_anchoring(&self, object_id: &str, record: &AnchoringRecord) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO passport_anchoring \
                (object_id, tx_hash, digest, version, anchored_at, uri, block_number) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (object_id) DO UPDATE SET \
                tx_hash = excluded.tx_hash, \
                digest = excluded.digest, \
                version = excluded.version, \
                anchored_at = excluded.anchored_at, \
                uri = excluded.uri, \
                block_number = excluded.block_number \
             WHERE excluded.version > passport_anchoring.version \
                OR excluded.tx_hash = passport_anchoring.tx_hash",
        )
        .bind(object_id)
        .bind(&record.tx_hash)
        .bind(record.digest.to_hex())
        .bind(to_i64(record.version)?)
        .bind(record.anchored_at)
        .bind(&record.uri)
        .bind(to_i64(record.block_number)?)
        .execute(self.pool.writer())
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidArgument(format!("{value} does not fit in i64")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use passport_core::{Digest, DigestKind, HASH_ALGORITHM};
    use test_log::test;

    async fn stores() -> (SqliteJobStore, SqliteAnchoringStore) {
        let pool = SqlitePool::connect_in_memory().await.unwrap();
        (
            SqliteJobStore::new(pool.clone()),
            SqliteAnchoringStore::new(pool),
        )
    }

    fn job(tx_hash: &str, object_id: &str, version: u64, created_at: DateTime<Utc>) -> AnchorJob {
        AnchorJob::pending(
            object_id,
            tx_hash,
            Digest::keccak(object_id.as_bytes()),
            DigestKind::Core,
            HASH_ALGORITHM,
            version,
            format!("ipfs://{object_id}"),
            created_at,
        )
    }

    #[test(tokio::test)]
    async fn insert_and_read_back() {
        let (jobs, _) = stores().await;
        let now = Utc::now();
        let original = job("0x01", "obj1", 1, now);
        jobs.insert_job(&original).await.unwrap();
        let stored = jobs.get_job("0x01").await.unwrap().unwrap();
        assert_eq!(stored, original);
        assert!(jobs.get_job("0x02").await.unwrap().is_none());
        // tx hash identifies exactly one submission
        assert!(jobs.insert_job(&original).await.is_err());
    }

    #[test(tokio::test)]
    async fn pending_jobs_are_oldest_first_and_limited() {
        let (jobs, _) = stores().await;
        let now = Utc::now();
        for (i, tx) in ["0x03", "0x01", "0x02"].iter().enumerate() {
            jobs.insert_job(&job(tx, "obj1", 1, now + chrono::Duration::seconds(i as i64)))
                .await
                .unwrap();
        }
        let pending = jobs.pending_jobs(2).await.unwrap();
        let hashes: Vec<_> = pending.iter().map(|j| j.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0x03", "0x01"]);

        assert!(jobs
            .finalize("0x03", JobStatus::Confirmed, Some(10), None, now)
            .await
            .unwrap());
        let pending = jobs.pending_jobs(5).await.unwrap();
        let hashes: Vec<_> = pending.iter().map(|j| j.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0x01", "0x02"]);
    }

    #[test(tokio::test)]
    async fn missed_polls_time_out_at_max_attempts() {
        let (jobs, _) = stores().await;
        let now = Utc::now();
        jobs.insert_job(&job("0x01", "obj1", 1, now)).await.unwrap();

        let first = jobs.record_missed_poll("0x01", 3, now).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.last_checked_at, Some(now));
        let second = jobs.record_missed_poll("0x01", 3, now).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Pending);
        let third = jobs.record_missed_poll("0x01", 3, now).await.unwrap().unwrap();
        assert_eq!(third.attempts, 3);
        assert_eq!(third.status, JobStatus::Timeout);
        assert_eq!(third.error.as_deref(), Some("no receipt after 3 checks"));

        // terminal jobs are left alone
        assert!(jobs.record_missed_poll("0x01", 3, now).await.unwrap().is_none());
        assert_eq!(jobs.get_job("0x01").await.unwrap().unwrap().attempts, 3);
    }

    #[test(tokio::test)]
    async fn finalize_only_moves_pending_jobs() {
        let (jobs, _) = stores().await;
        let now = Utc::now();
        jobs.insert_job(&job("0x01", "obj1", 1, now)).await.unwrap();

        assert!(jobs
            .finalize("0x01", JobStatus::Confirmed, Some(1000), None, now)
            .await
            .unwrap());
        assert!(!jobs
            .finalize("0x01", JobStatus::Failed, None, Some("late".to_owned()), now)
            .await
            .unwrap());
        let stored = jobs.get_job("0x01").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Confirmed);
        assert_eq!(stored.block_number, Some(1000));
        assert!(stored.error.is_none());

        assert!(jobs
            .finalize("0x01", JobStatus::Pending, None, None, now)
            .await
            .is_err());
    }

    #[test(tokio::test)]
    async fn anchoring_versions_never_decrease() {
        let (_, anchorings) = stores().await;
        let now = Utc::now();
        let v2 = AnchoringRecord::from_job(&job("0x02", "obj1", 2, now), 20, now);
        let v1 = AnchoringRecord::from_job(&job("0x01", "obj1", 1, now), 30, now);
        let v3 = AnchoringRecord::from_job(&job("0x03", "obj1", 3, now), 40, now);

        assert!(anchorings.get_anchoring("obj1").await.unwrap().is_none());
        assert!(anchorings.apply_anchoring("obj1", &v2).await.unwrap());
        assert!(!anchorings.apply_anchoring("obj1", &v1).await.unwrap());
        assert_eq!(anchorings.get_anchoring("obj1").await.unwrap(), Some(v2.clone()));
        // the same transaction may be applied again
        assert!(anchorings.apply_anchoring("obj1", &v2).await.unwrap());
        assert!(anchorings.apply_anchoring("obj1", &v3).await.unwrap());
        assert_eq!(anchorings.get_anchoring("obj1").await.unwrap(), Some(v3));
    }
}
