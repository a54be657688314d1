use std::{fmt::Formatter, str::FromStr};

use anyhow::{anyhow, Context};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha3::{Digest as _, Keccak256};

use crate::Record;

/// Label of the hash algorithm recorded on-chain next to every digest.
pub const HASH_ALGORITHM: &str = "keccak256";

/// A 256 bit content digest of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash arbitrary bytes with keccak-256.
    pub fn keccak(data: &[u8]) -> Self {
        Self(Keccak256::digest(data).into())
    }

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x` prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Digest").field(&self.to_hex()).finish()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).context("digest is not valid hex")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("digest must be 32 bytes not {}", b.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(de::Error::custom)
    }
}

/// Which field set of a record is digested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    /// Identity and descriptive fields only.
    #[default]
    Core,
    /// Core fields plus ownership chain, condition history and documents.
    Full,
}

impl DigestKind {
    /// Compute the digest of this kind for the record.
    pub fn digest(&self, record: &Record) -> Digest {
        match self {
            DigestKind::Core => core_digest(record),
            DigestKind::Full => full_digest(record),
        }
    }

    /// Lowercase name, as stored and accepted on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestKind::Core => "core",
            DigestKind::Full => "full",
        }
    }
}

impl std::fmt::Display for DigestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DigestKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(Self::Core),
            "full" => Ok(Self::Full),
            v => anyhow::bail!("unknown digest kind: {}", v),
        }
    }
}

/// Digest of the identity and descriptive fields of a record.
pub fn core_digest(record: &Record) -> Digest {
    Digest::keccak(canonical_json(&core_fields(record)).as_bytes())
}

/// Digest of the core fields plus ownership chain, condition history and documents.
pub fn full_digest(record: &Record) -> Digest {
    let mut fields = core_fields(record);
    fields.insert(
        "ownershipChain".to_owned(),
        json!(record.ownership_chain.as_slice()),
    );
    fields.insert(
        "conditionHistory".to_owned(),
        json!(record.condition_history.as_slice()),
    );
    fields.insert("documents".to_owned(), json!(record.documents.as_slice()));
    Digest::keccak(canonical_json(&fields).as_bytes())
}

fn core_fields(record: &Record) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("id".to_owned(), json!(record.id));
    fields.insert("title".to_owned(), json!(record.title));
    fields.insert("maker".to_owned(), json!(record.maker));
    fields.insert("year".to_owned(), json!(record.year));
    fields.insert("category".to_owned(), json!(record.category));
    fields.insert("condition".to_owned(), json!(record.condition));
    fields.insert("serialNumber".to_owned(), json!(record.serial_number));
    fields.insert("acquisitionDate".to_owned(), json!(record.acquisition_date));
    fields.insert("origin".to_owned(), json!(record.origin));
    fields.insert("provenanceNotes".to_owned(), json!(record.provenance_notes));
    fields
}

/// Compact JSON with object keys sorted at every depth. Array order is kept.
pub fn canonical_json(fields: &Map<String, Value>) -> String {
    sort_keys(Value::Object(fields.clone())).to_string()
}

// Maps are rebuilt by inserting in sorted order so the output does not depend on whether
// serde_json preserves insertion order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        v => v,
    }
}
