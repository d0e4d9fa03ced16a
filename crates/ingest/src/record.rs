use atomstore_store::{FileId, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One occurrence of an atom inside a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomRef {
    pub fingerprint: Fingerprint,
    /// Byte offset of the atom in the original file
    pub offset: u64,
    pub size: u64,
    /// This occurrence created the atom (or brought it back from orphan)
    pub is_new: bool,
}

impl AtomRef {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Result of ingesting one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub filename: String,
    pub total_size: u64,
    /// Fingerprint of the whole file
    pub fingerprint: Fingerprint,
    pub atom_sequence: Vec<AtomRef>,
    pub atoms_created: usize,
    pub atoms_reused: usize,
    pub ingested_at: DateTime<Utc>,
    pub processing_time_ms: u64,
}

impl FileRecord {
    /// Bytes of this file covered by atoms that already existed
    #[must_use]
    pub fn reused_bytes(&self) -> u64 {
        self.atom_sequence
            .iter()
            .filter(|atom| !atom.is_new)
            .map(|atom| atom.size)
            .sum()
    }

    /// Share of the file's bytes that did not need new storage
    #[must_use]
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.reused_bytes() as f64 / self.total_size as f64
    }

    /// Bytes this file did not add to physical storage
    #[must_use]
    pub fn storage_saved(&self) -> u64 {
        self.reused_bytes()
    }

    /// Distinct atoms with their occurrence counts, in first-occurrence order
    #[must_use]
    pub fn reference_counts(&self) -> Vec<(Fingerprint, u64)> {
        let mut positions: HashMap<&Fingerprint, usize> = HashMap::new();
        let mut counts: Vec<(Fingerprint, u64)> = Vec::new();
        for atom in &self.atom_sequence {
            match positions.get(&atom.fingerprint) {
                Some(&pos) => counts[pos].1 += 1,
                None => {
                    positions.insert(&atom.fingerprint, counts.len());
                    counts.push((atom.fingerprint.clone(), 1));
                }
            }
        }
        counts
    }

    /// Check the structural invariants of a record
    pub fn validate(&self) -> Result<(), String> {
        if self.atoms_created + self.atoms_reused != self.atom_sequence.len() {
            return Err(format!(
                "{}: {} created + {} reused != {} atoms",
                self.file_id,
                self.atoms_created,
                self.atoms_reused,
                self.atom_sequence.len()
            ));
        }
        let created = self.atom_sequence.iter().filter(|a| a.is_new).count();
        if created != self.atoms_created {
            return Err(format!(
                "{}: {created} atoms flagged new, expected {}",
                self.file_id, self.atoms_created
            ));
        }

        let mut expected = 0u64;
        for atom in &self.atom_sequence {
            if atom.offset != expected {
                return Err(format!(
                    "{}: atom {} at offset {}, expected {expected}",
                    self.file_id, atom.fingerprint, atom.offset
                ));
            }
            if atom.size == 0 {
                return Err(format!("{}: empty atom {}", self.file_id, atom.fingerprint));
            }
            expected = atom.end();
        }
        if expected != self.total_size {
            return Err(format!(
                "{}: atoms cover {expected} bytes of {}",
                self.file_id, self.total_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomstore_store::fingerprint;
    use pretty_assertions::assert_eq;

    fn record(parts: &[(&[u8], bool)]) -> FileRecord {
        let mut offset = 0;
        let atom_sequence: Vec<AtomRef> = parts
            .iter()
            .map(|(data, is_new)| {
                let atom = AtomRef {
                    fingerprint: fingerprint(data),
                    offset,
                    size: data.len() as u64,
                    is_new: *is_new,
                };
                offset += data.len() as u64;
                atom
            })
            .collect();
        let atoms_created = atom_sequence.iter().filter(|a| a.is_new).count();
        FileRecord {
            file_id: FileId::from_sequence(1),
            filename: "f.bin".into(),
            total_size: offset,
            fingerprint: fingerprint(b"whole"),
            atoms_reused: atom_sequence.len() - atoms_created,
            atom_sequence,
            atoms_created,
            ingested_at: Utc::now(),
            processing_time_ms: 0,
        }
    }

    #[test]
    fn dedup_ratio_is_size_weighted() {
        let rec = record(&[(b"aaaa", true), (b"bbbbbbbbbbbb", false)]);
        assert_eq!(rec.reused_bytes(), 12);
        assert_eq!(rec.storage_saved(), 12);
        assert!((rec.dedup_ratio() - 0.75).abs() < f64::EPSILON);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn empty_file_has_zero_ratio() {
        let rec = record(&[]);
        assert_eq!(rec.dedup_ratio(), 0.0);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn reference_counts_keep_first_occurrence_order() {
        let rec = record(&[(b"x", true), (b"y", true), (b"x", false)]);
        assert_eq!(
            rec.reference_counts(),
            vec![(fingerprint(b"x"), 2), (fingerprint(b"y"), 1)]
        );
    }

    #[test]
    fn validate_catches_gaps_and_bad_counts() {
        let mut rec = record(&[(b"ab", true), (b"cd", true)]);
        rec.atom_sequence[1].offset = 3;
        assert!(rec.validate().is_err());

        let mut rec = record(&[(b"ab", true)]);
        rec.atoms_reused = 1;
        assert!(rec.validate().is_err());

        let mut rec = record(&[(b"ab", true)]);
        rec.total_size = 5;
        assert!(rec.validate().is_err());
    }
}
