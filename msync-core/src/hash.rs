//! Content hashes for digest entries and aggregate summaries
//!
//! Every hash in msync is a SHA-256 digest. The text form is 64 lowercase
//! hex characters; that is also what goes over the wire.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::io::Read;

use crate::error::DigestError;

/// Length of a hash in raw bytes
pub const HASH_LEN: usize = 32;

/// Length of a hash in its hex text form
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// Chunk size used when streaming file content through the hasher
const READ_CHUNK: usize = 8 * 1024;

/// SHA-256 content hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash a byte slice
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Hash everything a reader yields, in fixed-size chunks
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Convert to lowercase hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, DigestError> {
        if hex_str.len() != HASH_HEX_LEN {
            return Err(DigestError::MalformedHash {
                value: hex_str.to_string(),
                reason: format!("expected {} hex characters, got {}", HASH_HEX_LEN, hex_str.len()),
            });
        }
        let mut arr = [0u8; HASH_LEN];
        hex::decode_to_slice(hex_str, &mut arr).map_err(|e| DigestError::MalformedHash {
            value: hex_str.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ContentHash {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let h = ContentHash::from_data(b"hello");
        let hex = h.to_hex();
        assert_eq!(hex.len(), HASH_HEX_LEN);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn test_known_sha256() {
        let h = ContentHash::from_data(b"");
        assert_eq!(
            h.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_uppercase_accepted_and_normalized() {
        let h = ContentHash::from_data(b"abc");
        let upper = h.to_hex().to_uppercase();
        let parsed = ContentHash::from_hex(&upper).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.to_hex(), h.to_hex());
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            ContentHash::from_hex("abc"),
            Err(DigestError::MalformedHash { .. })
        ));
        let not_hex = "z".repeat(HASH_HEX_LEN);
        assert!(matches!(
            ContentHash::from_hex(&not_hex),
            Err(DigestError::MalformedHash { .. })
        ));
        assert!(ContentHash::from_hex("").is_err());
    }

    #[test]
    fn test_reader_matches_slice() {
        let data = vec![7u8; READ_CHUNK * 3 + 17];
        let from_reader = ContentHash::from_reader(&data[..]).unwrap();
        assert_eq!(from_reader, ContentHash::from_data(&data));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = ContentHash::from_data(b"x");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
        assert!(serde_json::from_str::<ContentHash>("\"nothex\"").is_err());
    }
}
