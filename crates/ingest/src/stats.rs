use crate::file_log::FileLog;
use crate::record::FileRecord;
use atomstore_store::{Atom, AtomStore, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

/// Deduplication statistics over all live files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_files: u64,
    /// Logical bytes: sum of live file sizes
    pub total_size: u64,
    /// Atom references across live files, with multiplicity
    pub total_atoms: u64,
    /// Distinct atoms referenced by live files
    pub unique_atoms: u64,
    /// Physical bytes: sum of distinct atom sizes
    pub physical_size: u64,
    pub storage_saved: u64,
    pub dedup_ratio: f64,
    pub avg_reuse: f64,
    pub top_atoms: Vec<TopAtom>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopAtom {
    pub fingerprint: Fingerprint,
    pub usage_count: u64,
    pub size: u64,
}

/// Differences found by [`StatsAggregator::reconcile`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Cached totals that did not match the recomputed ones
    pub drift: Vec<String>,
    /// Atoms whose store usage disagrees with the file log
    pub store_mismatches: Vec<String>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty() && self.store_mismatches.is_empty()
    }
}

/// Ranking order: most used first, then oldest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    usage: Reverse<u64>,
    created_at: DateTime<Utc>,
    creation_seq: u64,
    fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedAtom {
    usage: u64,
    size: u64,
    created_at: DateTime<Utc>,
    creation_seq: u64,
}

impl TrackedAtom {
    fn rank_key(&self, fingerprint: &Fingerprint) -> RankKey {
        RankKey {
            usage: Reverse(self.usage),
            created_at: self.created_at,
            creation_seq: self.creation_seq,
            fingerprint: fingerprint.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_files: u64,
    total_size: u64,
    total_atoms: u64,
    physical_size: u64,
    atoms: HashMap<Fingerprint, TrackedAtom>,
    ranking: BTreeSet<RankKey>,
}

impl Totals {
    fn add_file(&mut self, record: &FileRecord, known: &HashMap<&Fingerprint, &Atom>) {
        self.total_files += 1;
        self.total_size += record.total_size;

        for (fingerprint, references) in record.reference_counts() {
            self.total_atoms += references;
            match self.atoms.get_mut(&fingerprint) {
                Some(tracked) => {
                    self.ranking.remove(&tracked.rank_key(&fingerprint));
                    tracked.usage += references;
                    self.ranking.insert(tracked.rank_key(&fingerprint));
                }
                None => {
                    let tracked = match known.get(&fingerprint) {
                        Some(atom) => TrackedAtom {
                            usage: references,
                            size: atom.size,
                            created_at: atom.created_at,
                            creation_seq: atom.creation_seq,
                        },
                        None => TrackedAtom {
                            usage: references,
                            size: size_in(record, &fingerprint),
                            created_at: record.ingested_at,
                            creation_seq: u64::MAX,
                        },
                    };
                    self.physical_size += tracked.size;
                    self.ranking.insert(tracked.rank_key(&fingerprint));
                    self.atoms.insert(fingerprint, tracked);
                }
            }
        }
    }

    fn remove_file(&mut self, record: &FileRecord) {
        self.total_files = self.total_files.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(record.total_size);

        for (fingerprint, references) in record.reference_counts() {
            self.total_atoms = self.total_atoms.saturating_sub(references);
            let Some(tracked) = self.atoms.get_mut(&fingerprint) else {
                log::warn!("Stats: {} references unknown atom {fingerprint}", record.file_id);
                continue;
            };
            self.ranking.remove(&tracked.rank_key(&fingerprint));
            tracked.usage = tracked.usage.saturating_sub(references);
            if tracked.usage == 0 {
                self.physical_size = self.physical_size.saturating_sub(tracked.size);
                self.atoms.remove(&fingerprint);
            } else {
                self.ranking.insert(tracked.rank_key(&fingerprint));
            }
        }
    }

    fn snapshot(&self, top_n: usize) -> DedupStats {
        let unique_atoms = self.atoms.len() as u64;
        let storage_saved = self.total_size.saturating_sub(self.physical_size);
        let dedup_ratio = if self.total_size == 0 {
            0.0
        } else {
            storage_saved as f64 / self.total_size as f64
        };
        let avg_reuse = if unique_atoms == 0 {
            1.0
        } else {
            self.total_atoms as f64 / unique_atoms as f64
        };

        let top_atoms = self
            .ranking
            .iter()
            .take(top_n)
            .filter_map(|key| {
                self.atoms.get(&key.fingerprint).map(|tracked| TopAtom {
                    fingerprint: key.fingerprint.clone(),
                    usage_count: tracked.usage,
                    size: tracked.size,
                })
            })
            .collect();

        DedupStats {
            total_files: self.total_files,
            total_size: self.total_size,
            total_atoms: self.total_atoms,
            unique_atoms,
            physical_size: self.physical_size,
            storage_saved,
            dedup_ratio,
            avg_reuse,
            top_atoms,
        }
    }

    fn diff(&self, fresh: &Self) -> Vec<String> {
        let mut drift = Vec::new();
        let fields = [
            ("total_files", self.total_files, fresh.total_files),
            ("total_size", self.total_size, fresh.total_size),
            ("total_atoms", self.total_atoms, fresh.total_atoms),
            ("physical_size", self.physical_size, fresh.physical_size),
            (
                "unique_atoms",
                self.atoms.len() as u64,
                fresh.atoms.len() as u64,
            ),
        ];
        for (name, cached, actual) in fields {
            if cached != actual {
                drift.push(format!("{name}: cached {cached}, actual {actual}"));
            }
        }
        if self.ranking != fresh.ranking {
            drift.push("top atom ranking differs".to_string());
        }
        drift
    }
}

fn size_in(record: &FileRecord, fingerprint: &Fingerprint) -> u64 {
    record
        .atom_sequence
        .iter()
        .find(|atom| &atom.fingerprint == fingerprint)
        .map_or(0, |atom| atom.size)
}

/// Incrementally maintained deduplication statistics.
///
/// Only files that finished ingestion are counted, so an aborted run never
/// shows up here. All updates for one file happen in a single critical
/// section.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    totals: Mutex<Totals>,
}

impl StatsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished file. `atoms` supplies creation metadata for the
    /// file's distinct atoms.
    pub fn record(&self, record: &FileRecord, atoms: &[Atom]) {
        let known: HashMap<&Fingerprint, &Atom> =
            atoms.iter().map(|atom| (&atom.fingerprint, atom)).collect();
        self.lock().add_file(record, &known);
    }

    /// Remove a deleted file from the totals
    pub fn forget(&self, record: &FileRecord) {
        self.lock().remove_file(record);
    }

    #[must_use]
    pub fn snapshot(&self, top_n: usize) -> DedupStats {
        self.lock().snapshot(top_n)
    }

    /// Recompute everything from the store and the file log, replace the
    /// cached totals and report what differed.
    ///
    /// Meaningful when no ingestion is in flight.
    pub fn reconcile(&self, store: &AtomStore, files: &FileLog) -> ReconcileReport {
        let atoms = store.atoms();
        let known: HashMap<&Fingerprint, &Atom> =
            atoms.iter().map(|atom| (&atom.fingerprint, atom)).collect();

        let mut fresh = Totals::default();
        for record in files.records() {
            fresh.add_file(record, &known);
        }

        let mut store_mismatches = Vec::new();
        for atom in &atoms {
            let expected = fresh.atoms.get(&atom.fingerprint).map_or(0, |t| t.usage);
            if atom.usage_count != expected {
                store_mismatches.push(format!(
                    "atom {} has usage_count {} but live files reference it {expected} times",
                    atom.fingerprint, atom.usage_count
                ));
            }
        }
        for fingerprint in fresh.atoms.keys() {
            if !known.contains_key(fingerprint) {
                store_mismatches.push(format!(
                    "atom {fingerprint} is referenced by a live file but missing from the store"
                ));
            }
        }
        store_mismatches.sort();

        let mut totals = self.lock();
        let drift = totals.diff(&fresh);
        if !drift.is_empty() {
            log::warn!("Statistics drift corrected: {}", drift.join("; "));
        }
        *totals = fresh;

        ReconcileReport {
            drift,
            store_mismatches,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AtomRef;
    use atomstore_store::{fingerprint, AtomKind, FileId};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn atom(data: &[u8], seq: u64, secs: i64) -> Atom {
        Atom {
            fingerprint: fingerprint(data),
            size: data.len() as u64,
            kind: AtomKind::Text,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            creation_seq: seq,
            usage_count: 0,
            owners: Vec::new(),
        }
    }

    fn file(id: u64, parts: &[&[u8]]) -> FileRecord {
        let mut offset = 0;
        let atom_sequence: Vec<AtomRef> = parts
            .iter()
            .map(|data| {
                let r = AtomRef {
                    fingerprint: fingerprint(data),
                    offset,
                    size: data.len() as u64,
                    is_new: false,
                };
                offset += data.len() as u64;
                r
            })
            .collect();
        FileRecord {
            file_id: FileId::from_sequence(id),
            filename: format!("f{id}"),
            total_size: offset,
            fingerprint: fingerprint(&id.to_le_bytes()),
            atoms_created: 0,
            atoms_reused: atom_sequence.len(),
            atom_sequence,
            ingested_at: Utc::now(),
            processing_time_ms: 0,
        }
    }

    #[test]
    fn empty_stats() {
        let stats = StatsAggregator::new().snapshot(10);
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.dedup_ratio, 0.0);
        assert_eq!(stats.avg_reuse, 1.0);
        assert!(stats.top_atoms.is_empty());
    }

    #[test]
    fn record_and_forget_are_symmetric() {
        let atoms = [atom(b"aaaa", 0, 10), atom(b"bb", 1, 10), atom(b"c", 2, 20)];
        let stats = StatsAggregator::new();
        let first = file(1, &[b"aaaa", b"bb", b"aaaa"]);
        let second = file(2, &[b"bb", b"c"]);

        stats.record(&first, &atoms);
        stats.record(&second, &atoms);
        let snap = stats.snapshot(10);
        assert_eq!(snap.total_files, 2);
        assert_eq!(snap.total_size, 13);
        assert_eq!(snap.total_atoms, 5);
        assert_eq!(snap.unique_atoms, 3);
        assert_eq!(snap.physical_size, 7);
        assert_eq!(snap.storage_saved, 6);
        assert!((snap.avg_reuse - 5.0 / 3.0).abs() < 1e-9);

        // Totals cover live files; storage_saved stays the sum over live atoms.
        stats.forget(&first);
        let snap = stats.snapshot(10);
        assert_eq!(snap.total_files, 1);
        assert_eq!(snap.total_size, 3);
        assert_eq!(snap.unique_atoms, 2);
        assert_eq!(snap.physical_size, 3);
        assert_eq!(snap.storage_saved, 0);

        stats.forget(&second);
        assert_eq!(stats.snapshot(10), StatsAggregator::new().snapshot(10));
    }

    #[test]
    fn ranking_breaks_ties_by_creation() {
        let older = atom(b"older", 5, 100);
        let newer = atom(b"newer", 1, 200);
        let same_time = atom(b"same time", 6, 100);
        let busy = atom(b"busy", 9, 300);
        let atoms = [older.clone(), newer.clone(), same_time.clone(), busy.clone()];

        let stats = StatsAggregator::new();
        stats.record(
            &file(1, &[b"newer", b"older", b"same time", b"busy", b"busy"]),
            &atoms,
        );

        let order: Vec<_> = stats
            .snapshot(10)
            .top_atoms
            .into_iter()
            .map(|t| t.fingerprint)
            .collect();
        assert_eq!(
            order,
            vec![
                busy.fingerprint,
                older.fingerprint,
                same_time.fingerprint,
                newer.fingerprint
            ]
        );
        assert_eq!(stats.snapshot(2).top_atoms.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_replaces_drifted_totals() {
        let store = AtomStore::in_memory();
        let mut files = FileLog::new();
        let data: &[u8] = b"payload";
        let fp = fingerprint(data);
        let id = files.allocate_id();
        let (created, _) = store.get_or_create(&fp, data, AtomKind::Text).await.unwrap();
        store.link_file(&fp, &id, 1).unwrap();
        let mut record = file(1, &[data]);
        record.file_id = id;
        files.insert(record.clone());

        let stats = StatsAggregator::new();
        stats.record(&record, &[created.clone()]);
        stats.record(&record, &[created]);

        let report = stats.reconcile(&store, &files);
        assert!(!report.drift.is_empty());
        assert!(report.store_mismatches.is_empty());
        assert_eq!(stats.snapshot(10).total_files, 1);

        let again = stats.reconcile(&store, &files);
        assert!(again.is_clean(), "{again:?}");
    }
}
