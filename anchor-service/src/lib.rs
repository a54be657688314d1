//! Lifecycle of passport anchors: submission, asynchronous confirmation and verification.
//!
//! The chain is reached through the [`AnchorChain`] seam and state is persisted through the
//! [`JobStore`] and [`AnchoringStore`] seams. [`AnchorService`] ties them together and exposes the
//! operations the application calls.
mod chain;
mod error;
mod metrics;
pub mod mock;
mod service;
mod sqlite;
mod store;
mod verification;
mod worker;


pub use chain::{AnchorCall, AnchorChain, AnchorEvent, FeeOverrides, TxReceipt};
pub use error::{Error, SubmissionFailure};
pub use metrics::Metrics;
pub use service::{
    AnchorService, ServiceConfig, SubmitMode, SubmitOutcome, SubmitRequest, TransactionStatus,
    TxState,
};
pub use sqlite::{SqliteAnchoringStore, SqliteJobStore};
pub use store::{AnchoringStore, JobStore};
pub use verification::{most_recent, LatestAnchor, Verification};
pub use worker::{
    BatchReport, ConfirmationWorker, JobOutcome, JobResult, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_ATTEMPTS,
};

/// Result type of anchoring operations
pub type Result<T> = std::result::Result<T, Error>;
