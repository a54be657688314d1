use serde::{Deserialize, Serialize};

/// The subset of a registry record that takes part in anchoring.
///
/// The application owns the full record; fields it carries beyond these are ignored on
/// deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Application id of the record.
    pub id: String,
    /// Display title.
    pub title: Option<String>,
    /// Maker or brand.
    pub maker: Option<String>,
    /// Year of manufacture.
    pub year: Option<i32>,
    /// Collection category.
    pub category: Option<String>,
    /// Current condition grade.
    pub condition: Option<String>,
    /// Maker serial number.
    pub serial_number: Option<String>,
    /// Date the current owner acquired the object.
    pub acquisition_date: Option<String>,
    /// Country or place of origin.
    pub origin: Option<String>,
    /// Ordered chain of previous and current owners.
    #[serde(default)]
    pub ownership_chain: Vec<OwnershipEntry>,
    /// Ordered condition assessments.
    #[serde(default)]
    pub condition_history: Vec<ConditionEntry>,
    /// Associated documents such as receipts and certificates.
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
    /// Free form provenance notes.
    pub provenance_notes: Option<String>,
}

impl Record {
    /// Construct a record with only an id set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A single link in the ownership chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipEntry {
    /// Owner name or handle.
    pub owner: String,
    /// When the owner acquired the object.
    pub acquired_at: Option<String>,
    /// Notes about the transfer.
    pub notes: Option<String>,
}

/// A condition assessment at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionEntry {
    /// Condition grade.
    pub condition: String,
    /// When the assessment was made.
    pub recorded_at: Option<String>,
    /// Assessment notes.
    pub notes: Option<String>,
}

/// Reference to a document stored off-chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    /// Document id in the document store.
    pub id: String,
    /// Locator of the document.
    pub uri: String,
    /// Document kind, e.g. receipt or certificate.
    pub kind: Option<String>,
}
