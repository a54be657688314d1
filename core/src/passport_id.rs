use std::fmt::Formatter;

use serde::{Serialize, Serializer};

/// A record id encoded into the fixed 32 byte field used on-chain.
///
/// The UTF-8 bytes of the id are copied in order, padded with zero bytes and truncated at 32
/// bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassportId([u8; 32]);

impl PassportId {
    /// Encode an application record id.
    pub fn from_record_id(id: &str) -> Self {
        let mut bytes = [0u8; 32];
        let src = id.as_bytes();
        let len = src.len().min(32);
        bytes[..len].copy_from_slice(&src[..len]);
        Self(bytes)
    }

    /// Wrap raw bytes read from the chain.
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

impl std::fmt::Debug for PassportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PassportId").field(&self.to_hex()).finish()
    }
}

impl std::fmt::Display for PassportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PassportId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn short_ids_are_null_padded() {
        let id = PassportId::from_record_id("obj1");
        assert_eq!(&id.as_bytes()[..4], b"obj1");
        assert!(id.as_bytes()[4..].iter().all(|b| *b == 0));
        expect![[r#"0x6f626a3100000000000000000000000000000000000000000000000000000000"#]]
            .assert_eq(&id.to_hex());
    }

    #[test]
    fn long_ids_are_truncated() {
        let long = "a".repeat(40);
        let id = PassportId::from_record_id(&long);
        assert_eq!(id.as_bytes(), &[b'a'; 32]);
        assert_eq!(id, PassportId::from_record_id(&long[..32]));
    }

    #[test]
    fn empty_id_is_zero() {
        assert_eq!(PassportId::from_record_id("").as_bytes(), &[0u8; 32]);
    }
}
