//! Content fingerprints.
//!
//! Atoms are identified by the SHA-256 of their bytes. Identical bytes always
//! give identical fingerprints. Distinct bytes that collide are not detected:
//! no byte-for-byte comparison is made on reuse, the hash width makes that
//! case negligible.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

/// Hex length of a SHA-256 fingerprint
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of an atom (or a whole file)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint, accepting upper- or lowercase hex
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != FINGERPRINT_HEX_LEN {
            return Err(StoreError::invalid_input(format!(
                "fingerprint must be {FINGERPRINT_HEX_LEN} hex characters, got {}",
                raw.len()
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::invalid_input(format!(
                "fingerprint contains non-hex characters: {raw}"
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First byte of the digest, used to pick a shard or a directory
    #[must_use]
    pub fn leading_byte(&self) -> u8 {
        u8::from_str_radix(&self.0[..2], 16).unwrap_or(0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Fingerprint {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Fingerprint a byte slice
#[must_use]
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    let mut hasher = IncrementalHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Streaming fingerprint, used for whole-file hashes
#[derive(Clone, Default)]
pub struct IncrementalHasher {
    inner: Sha256,
}

impl IncrementalHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.inner.finalize()))
    }
}

/// True when `raw` could be the start of a fingerprint
#[must_use]
pub fn is_hex_prefix(raw: &str) -> bool {
    raw.len() <= FINGERPRINT_HEX_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            fingerprint(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_input_has_a_fingerprint() {
        assert_eq!(
            fingerprint(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = IncrementalHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), fingerprint(b"hello world"));
    }

    #[test]
    fn parse_normalizes_case_and_rejects_garbage() {
        let fp = fingerprint(b"x");
        let upper = fp.as_str().to_ascii_uppercase();
        assert_eq!(Fingerprint::parse(&upper).unwrap(), fp);
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"z".repeat(64)).is_err());
    }

    #[test]
    fn serde_rejects_invalid_fingerprint() {
        let parsed: std::result::Result<Fingerprint, _> = serde_json::from_str("\"nothex\"");
        assert!(parsed.is_err());

        let fp = fingerprint(b"x");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{fp}\""));
    }

    #[test]
    fn hex_prefix_detection() {
        assert!(is_hex_prefix("ab3"));
        assert!(is_hex_prefix(""));
        assert!(!is_hex_prefix("xyz"));
    }
}
