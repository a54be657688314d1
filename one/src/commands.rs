use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::debug;

use passport_anchor_service::{FeeOverrides, SubmitMode, SubmitRequest};
use passport_core::{core_digest, full_digest, DigestKind, PassportId, Record, HASH_ALGORITHM};

use crate::{AnchorOpts, ChainAccess, LogOpts};

#[derive(Args, Debug)]
pub(crate) struct SubmitOpts {
    /// JSON file holding the record to anchor.
    #[arg(long)]
    pub(crate) record: PathBuf,

    /// Field set of the record that is digested.
    #[arg(long, default_value = "core")]
    pub(crate) kind: DigestKind,

    /// Off-chain locator of the anchored content.
    #[arg(long)]
    pub(crate) uri: String,

    /// Anchor version, must be newer than the stored anchoring of the record.
    #[arg(long)]
    pub(crate) version: u64,

    /// Wait for the transaction to be mined instead of queueing a confirmation job.
    #[arg(long, default_value_t = false)]
    pub(crate) sync: bool,

    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,
}

#[derive(Args, Debug)]
pub(crate) struct ConfirmOpts {
    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,
}

#[derive(Args, Debug)]
pub(crate) struct VerifyOpts {
    /// JSON file holding the record to verify.
    #[arg(long)]
    pub(crate) record: PathBuf,

    /// Field set of the record that is digested.
    #[arg(long, default_value = "core")]
    pub(crate) kind: DigestKind,

    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,
}

#[derive(Args, Debug)]
pub(crate) struct LatestOpts {
    /// JSON file holding the record.
    #[arg(long)]
    pub(crate) record: PathBuf,

    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,
}

#[derive(Args, Debug)]
pub(crate) struct StatusOpts {
    /// Hash of the transaction.
    pub(crate) tx_hash: String,

    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,
}

#[derive(Args, Debug)]
pub(crate) struct DigestOpts {
    /// JSON file holding the record.
    #[arg(long)]
    pub(crate) record: PathBuf,
}

/// Digests of a record as printed by the `digest` command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordDigests {
    object_id: String,
    passport_id: PassportId,
    algo: &'static str,
    core_digest: passport_core::Digest,
    full_digest: passport_core::Digest,
}

impl RecordDigests {
    fn new(record: &Record) -> Self {
        Self {
            object_id: record.id.clone(),
            passport_id: PassportId::from_record_id(&record.id),
            algo: HASH_ALGORITHM,
            core_digest: core_digest(record),
            full_digest: full_digest(record),
        }
    }
}

fn init_tracing(log_opts: &LogOpts) -> Result<()> {
    passport_metrics::init_local_tracing(log_opts.format())
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

async fn read_record(path: &Path) -> Result<Record> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read record file {}", path.display()))?;
    let record: Record = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not a valid record", path.display()))?;
    debug!(object_id = record.id, "read record");
    Ok(record)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) async fn submit(opts: SubmitOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let record = read_record(&opts.record).await?;
    let (service, _chain) = opts.anchor.service(ChainAccess::Submit).await?;
    let outcome = service
        .submit_anchor(SubmitRequest {
            record,
            kind: opts.kind,
            uri: opts.uri,
            version: opts.version,
            mode: if opts.sync {
                SubmitMode::Sync
            } else {
                SubmitMode::Async
            },
            fees: FeeOverrides::default(),
        })
        .await?;
    print_json(&outcome)
}

pub(crate) async fn confirm(opts: ConfirmOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let (service, _chain) = opts.anchor.service(ChainAccess::ReadOnly).await?;
    let report = service.run_confirmation_batch().await?;
    print_json(&report)
}

pub(crate) async fn verify(opts: VerifyOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let record = read_record(&opts.record).await?;
    let (service, _chain) = opts.anchor.service(ChainAccess::ReadOnly).await?;
    let verification = service.verify_anchor(&record, opts.kind).await?;
    print_json(&verification)
}

pub(crate) async fn latest(opts: LatestOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let record = read_record(&opts.record).await?;
    let (service, _chain) = opts.anchor.service(ChainAccess::ReadOnly).await?;
    let latest = service.latest_anchor_event(&record).await?;
    print_json(&latest)
}

pub(crate) async fn status(opts: StatusOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let (service, _chain) = opts.anchor.service(ChainAccess::ReadOnly).await?;
    let status = service.get_transaction_status(&opts.tx_hash).await?;
    print_json(&status)
}

pub(crate) async fn digest(opts: DigestOpts, log_opts: LogOpts) -> Result<()> {
    init_tracing(&log_opts)?;
    let record = read_record(&opts.record).await?;
    print_json(&RecordDigests::new(&record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use passport_core::OwnershipEntry;
    use test_log::test;

    #[test]
    fn digests_of_a_record() {
        let mut record = Record::new("obj1");
        record.title = Some("Watch".to_owned());
        let digests = RecordDigests::new(&record);
        assert_eq!(digests.core_digest, digests.full_digest);
        assert_eq!(digests.passport_id, PassportId::from_record_id("obj1"));

        record.ownership_chain.push(OwnershipEntry {
            owner: "alice".to_owned(),
            acquired_at: None,
            notes: None,
        });
        let digests = RecordDigests::new(&record);
        assert_ne!(digests.core_digest, digests.full_digest);

        let json = serde_json::to_value(&digests).unwrap();
        assert_eq!(json["objectId"], "obj1");
        assert_eq!(json["algo"], HASH_ALGORITHM);
        assert_eq!(
            json["passportId"],
            "0x6f626a3100000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test(tokio::test)]
    async fn reads_record_file() {
        let dir = std::env::temp_dir().join(format!("passport-one-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("record.json");
        tokio::fs::write(
            &path,
            r#"{"id": "obj1", "title": "Watch", "ownershipChain": [{"owner": "alice"}]}"#,
        )
        .await
        .unwrap();

        let record = read_record(&path).await.unwrap();
        assert_eq!(record.id, "obj1");
        assert_eq!(record.title.as_deref(), Some("Watch"));
        assert_eq!(record.ownership_chain.len(), 1);

        let err = read_record(&dir.join("missing.json")).await.unwrap_err();
        assert!(err.to_string().contains("failed to read record file"), "{err}");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
