//! # Passport Core
//! Core types for anchoring registry records: the record subset that is digested, the fixed width
//! passport id, content digests and the persisted anchoring state.
#![warn(missing_docs)]
mod anchoring;
mod digest;
mod passport_id;
mod record;

pub use anchoring::{AnchorJob, AnchoringRecord, JobStatus};
pub use digest::{canonical_json, core_digest, full_digest, Digest, DigestKind, HASH_ALGORITHM};
pub use passport_id::PassportId;
pub use record::{ConditionEntry, DocumentRef, OwnershipEntry, Record};
