use crate::hasher::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse content classification, fixed when the atom is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomKind {
    Text,
    Binary,
    Image,
}

impl AtomKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Image => "image",
        }
    }

    /// Text when the bytes are UTF-8 without NUL, binary otherwise
    #[must_use]
    pub fn classify(data: &[u8]) -> Self {
        if !data.contains(&0) && std::str::from_utf8(data).is_ok() {
            Self::Text
        } else {
            Self::Binary
        }
    }

    /// Sniff common image signatures at the start of a file
    #[must_use]
    pub fn is_image(file_head: &[u8]) -> bool {
        const SIGNATURES: [&[u8]; 6] = [
            b"\x89PNG\r\n\x1a\n",
            b"\xff\xd8\xff",
            b"GIF87a",
            b"GIF89a",
            b"MM\0*",
            b"II*\0",
        ];
        if SIGNATURES.iter().any(|sig| file_head.starts_with(sig)) {
            return true;
        }
        file_head.len() >= 12 && &file_head[..4] == b"RIFF" && &file_head[8..12] == b"WEBP"
    }
}

impl fmt::Display for AtomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an ingested file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Id for the n-th file ingested into a store
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("file-{seq:06}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file linked to an atom, with the number of times its atom
/// sequence references the atom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomOwner {
    pub file_id: FileId,
    pub references: u64,
}

/// The unit of deduplicated content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub kind: AtomKind,
    pub created_at: DateTime<Utc>,
    /// Store-wide creation order; breaks ties between equal timestamps
    pub creation_seq: u64,
    /// References currently held, counted with multiplicity
    pub usage_count: u64,
    /// Distinct owners in first-association order
    pub owners: Vec<AtomOwner>,
}

impl Atom {
    /// Distinct owning files in first-association order
    pub fn owning_files(&self) -> impl Iterator<Item = &FileId> {
        self.owners.iter().map(|owner| &owner.file_id)
    }

    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// References attributed to owners
    #[must_use]
    pub fn linked_references(&self) -> u64 {
        self.owners.iter().map(|owner| owner.references).sum()
    }

    #[must_use]
    pub fn references_from(&self, file_id: &FileId) -> u64 {
        self.owners
            .iter()
            .find(|owner| &owner.file_id == file_id)
            .map_or(0, |owner| owner.references)
    }
}

/// One page of a prefix search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixScan {
    pub atoms: Vec<Atom>,
    /// Visible atoms matching the prefix, including those past the page
    pub total: usize,
}

/// Result of removing a file's link to an atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkOutcome {
    pub size: u64,
    pub references_removed: u64,
    pub remaining_usage: u64,
    /// The atom dropped to zero references and awaits eviction
    pub orphaned: bool,
}

/// Result of dropping one unclaimed reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub size: u64,
    pub remaining_usage: u64,
    pub orphaned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictedAtom {
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub evicted: Vec<EvictedAtom>,
    pub bytes_freed: u64,
    /// Orphans or stray payloads left in place because a delete failed
    pub deferred: usize,
    /// Payloads deleted because no atom referred to them
    pub stray_payloads: usize,
}

/// Result of checking the store's reference-count invariants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub atoms_checked: usize,
    pub orphans: usize,
    /// References acquired by ingestions that have not linked yet
    pub unclaimed_references: u64,
    pub violations: Vec<String>,
}

impl InvariantReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// No violations and no ingestion in flight
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.is_ok() && self.unclaimed_references == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint;

    fn atom(data: &[u8], usage: u64, seq: u64) -> Atom {
        Atom {
            fingerprint: fingerprint(data),
            size: data.len() as u64,
            kind: AtomKind::Text,
            created_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            creation_seq: seq,
            usage_count: usage,
            owners: Vec::new(),
        }
    }

    #[test]
    fn classify_text_and_binary() {
        assert_eq!(AtomKind::classify(b"hello\n"), AtomKind::Text);
        assert_eq!(AtomKind::classify(b"he\0llo"), AtomKind::Binary);
        assert_eq!(AtomKind::classify(&[0xff, 0xfe, 0x80]), AtomKind::Binary);
    }

    #[test]
    fn image_signatures() {
        assert!(AtomKind::is_image(b"\x89PNG\r\n\x1a\n...."));
        assert!(AtomKind::is_image(b"RIFF\0\0\0\0WEBPVP8 "));
        assert!(!AtomKind::is_image(b"plain text"));
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AtomKind::Image).unwrap(), "\"image\"");
    }

    #[test]
    fn owner_accounting() {
        let mut a = atom(b"x", 3, 0);
        a.owners.push(AtomOwner {
            file_id: FileId::from_sequence(1),
            references: 2,
        });
        a.owners.push(AtomOwner {
            file_id: FileId::from_sequence(2),
            references: 1,
        });
        assert_eq!(a.linked_references(), 3);
        assert_eq!(a.owner_count(), 2);
        assert_eq!(a.references_from(&FileId::from_sequence(1)), 2);
        assert_eq!(a.references_from(&FileId::new("missing")), 0);
        assert_eq!(
            a.owning_files().map(FileId::as_str).collect::<Vec<_>>(),
            vec!["file-000001", "file-000002"]
        );
    }
}
