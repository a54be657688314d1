use serde::Serialize;

use passport_core::Digest;

use crate::chain::AnchorEvent;

/// Answer to "is this digest anchored for the record".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub is_anchored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl From<Option<&AnchorEvent>> for Verification {
    fn from(event: Option<&AnchorEvent>) -> Self {
        match event {
            Some(event) => Self {
                is_anchored: true,
                tx_hash: Some(event.tx_hash.clone()),
                block_number: Some(event.block_number),
            },
            None => Self::default(),
        }
    }
}

/// The latest anchor event of a record, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestAnchor {
    pub digest: Digest,
    pub uri: String,
    pub version: u64,
    pub tx_hash: String,
    pub block_number: u64,
}

impl From<AnchorEvent> for LatestAnchor {
    fn from(event: AnchorEvent) -> Self {
        Self {
            digest: event.digest,
            uri: event.uri,
            version: event.version,
            tx_hash: event.tx_hash,
            block_number: event.block_number,
        }
    }
}

/// The most recent event, ordered by block number then log index, optionally restricted to a
/// digest.
pub fn most_recent<'a>(
    events: impl IntoIterator<Item = &'a AnchorEvent>,
    digest: Option<&Digest>,
) -> Option<&'a AnchorEvent> {
    events
        .into_iter()
        .filter(|e| digest.map_or(true, |d| &e.digest == d))
        .max_by_key(|e| (e.block_number, e.log_index))
}
