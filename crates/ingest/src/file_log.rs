use crate::record::FileRecord;
use atomstore_store::{FileId, Fingerprint};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Live file records, keyed by id, with a whole-file fingerprint lookup
#[derive(Debug, Default, Clone)]
pub struct FileLog {
    files: BTreeMap<FileId, Arc<FileRecord>>,
    by_fingerprint: HashMap<Fingerprint, Vec<FileId>>,
    next_seq: u64,
}

impl FileLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records; `next_seq` never goes backwards
    pub fn from_records(
        records: impl IntoIterator<Item = FileRecord>,
        next_seq: u64,
    ) -> Result<Self, String> {
        let mut log = Self {
            next_seq,
            ..Self::default()
        };
        for record in records {
            record.validate()?;
            if log.files.contains_key(&record.file_id) {
                return Err(format!("duplicate file id {}", record.file_id));
            }
            log.insert(record);
        }
        Ok(log)
    }

    /// Reserve a fresh file id
    pub fn allocate_id(&mut self) -> FileId {
        loop {
            self.next_seq += 1;
            let id = FileId::from_sequence(self.next_seq);
            if !self.files.contains_key(&id) {
                return id;
            }
        }
    }

    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn insert(&mut self, record: FileRecord) -> Arc<FileRecord> {
        let record = Arc::new(record);
        self.by_fingerprint
            .entry(record.fingerprint.clone())
            .or_default()
            .push(record.file_id.clone());
        if let Some(id) = record
            .file_id
            .as_str()
            .strip_prefix("file-")
            .and_then(|n| n.parse::<u64>().ok())
        {
            self.next_seq = self.next_seq.max(id);
        }
        self.files.insert(record.file_id.clone(), record.clone());
        record
    }

    pub fn remove(&mut self, file_id: &FileId) -> Option<Arc<FileRecord>> {
        let record = self.files.remove(file_id)?;
        if let Some(ids) = self.by_fingerprint.get_mut(&record.fingerprint) {
            ids.retain(|id| id != file_id);
            if ids.is_empty() {
                self.by_fingerprint.remove(&record.fingerprint);
            }
        }
        Some(record)
    }

    #[must_use]
    pub fn get(&self, file_id: &FileId) -> Option<Arc<FileRecord>> {
        self.files.get(file_id).cloned()
    }

    /// Oldest live file with this whole-file fingerprint
    #[must_use]
    pub fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<Arc<FileRecord>> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|ids| ids.first())
            .and_then(|id| self.get(id))
    }

    #[must_use]
    pub fn filename(&self, file_id: &FileId) -> Option<&str> {
        self.files.get(file_id).map(|record| record.filename.as_str())
    }

    /// Records ordered by file id
    pub fn records(&self) -> impl Iterator<Item = &Arc<FileRecord>> {
        self.files.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomstore_store::fingerprint;
    use chrono::Utc;

    fn empty_record(file_id: FileId, whole: &[u8]) -> FileRecord {
        FileRecord {
            file_id,
            filename: "empty.txt".into(),
            total_size: 0,
            fingerprint: fingerprint(whole),
            atom_sequence: Vec::new(),
            atoms_created: 0,
            atoms_reused: 0,
            ingested_at: Utc::now(),
            processing_time_ms: 0,
        }
    }

    #[test]
    fn ids_are_sequential_and_unique() {
        let mut log = FileLog::new();
        let a = log.allocate_id();
        let b = log.allocate_id();
        assert_eq!(a.as_str(), "file-000001");
        assert_eq!(b.as_str(), "file-000002");
    }

    #[test]
    fn fingerprint_lookup_follows_removals() {
        let mut log = FileLog::new();
        let first = log.allocate_id();
        let second = log.allocate_id();
        log.insert(empty_record(first.clone(), b"same"));
        log.insert(empty_record(second.clone(), b"same"));

        let fp = fingerprint(b"same");
        assert_eq!(log.find_by_fingerprint(&fp).unwrap().file_id, first);
        log.remove(&first);
        assert_eq!(log.find_by_fingerprint(&fp).unwrap().file_id, second);
        log.remove(&second);
        assert!(log.find_by_fingerprint(&fp).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn restored_log_does_not_reuse_ids() {
        let records = vec![empty_record(FileId::from_sequence(7), b"x")];
        let mut log = FileLog::from_records(records, 0).unwrap();
        assert_eq!(log.allocate_id(), FileId::from_sequence(8));

        let dupes = vec![
            empty_record(FileId::from_sequence(1), b"x"),
            empty_record(FileId::from_sequence(1), b"y"),
        ];
        assert!(FileLog::from_records(dupes, 0).is_err());
    }
}
