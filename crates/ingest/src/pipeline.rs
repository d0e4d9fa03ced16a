use crate::config::{PipelineConfig, MAX_TOP_ATOMS};
use crate::error::{IngestError, Result};
use crate::file_log::FileLog;
use crate::limits::{acquire_ingest_permit, ingest_concurrency_snapshot};
use crate::record::{AtomRef, FileRecord};
use crate::state::{IngestState, StateTracker};
use crate::stats::{DedupStats, ReconcileReport, StatsAggregator};
use atomstore_chunker::{ChunkSpan, Chunker, ChunkerConfig};
use atomstore_store::{
    fingerprint, Atom, AtomKind, AtomStore, FileId, Fingerprint, GcReport, IncrementalHasher,
    InvariantReport,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Cooperative cancellation for an in-flight ingestion.
///
/// Checked between steps and before every atom lookup. Dropping the
/// ingestion future has the same effect.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub file_id: FileId,
    pub atoms_unlinked: usize,
    /// Atoms left without references; reclaimed by garbage collection
    pub orphaned: usize,
}

/// One atom occurrence of a file with its current store-wide usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomUsage {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    pub size: u64,
    pub is_new: bool,
    pub reuse_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBreakdown {
    pub file_id: FileId,
    pub filename: String,
    pub fingerprint: Fingerprint,
    pub total_size: u64,
    pub atoms: Vec<AtomUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub invariants: InvariantReport,
    pub stats: ReconcileReport,
}

impl VerifyReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.invariants.is_ok() && self.stats.store_mismatches.is_empty()
    }
}

/// Files are read in blocks of this size while being hashed
const READ_BLOCK_SIZE: usize = 64 * 1024;

/// One input of [`IngestionPipeline::ingest_many`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSource {
    Bytes { filename: String, data: Vec<u8> },
    Path(PathBuf),
}

impl From<(String, Vec<u8>)> for IngestSource {
    fn from((filename, data): (String, Vec<u8>)) -> Self {
        Self::Bytes { filename, data }
    }
}

impl From<PathBuf> for IngestSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for IngestSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

enum Source {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Turns files into atoms, links them and keeps statistics current
#[derive(Clone)]
pub struct IngestionPipeline {
    chunker: Arc<Chunker>,
    store: Arc<AtomStore>,
    files: Arc<RwLock<FileLog>>,
    stats: Arc<StatsAggregator>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        chunker_config: ChunkerConfig,
        store: Arc<AtomStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Self::with_file_log(chunker_config, store, FileLog::new(), config)
    }

    /// Pipeline over an existing store and file log; statistics are
    /// rebuilt from both
    pub fn with_file_log(
        chunker_config: ChunkerConfig,
        store: Arc<AtomStore>,
        files: FileLog,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate().map_err(IngestError::invalid_config)?;
        let chunker = Chunker::new(chunker_config)?;

        let pipeline = Self {
            chunker: Arc::new(chunker),
            store,
            files: Arc::new(RwLock::new(files)),
            stats: Arc::new(StatsAggregator::new()),
            config,
        };

        let report = pipeline.reconcile_stats();
        if !report.store_mismatches.is_empty() {
            log::warn!(
                "File log and store disagree on {} atoms",
                report.store_mismatches.len()
            );
        }
        Ok(pipeline)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AtomStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn files(&self) -> RwLockReadGuard<'_, FileLog> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_mut(&self) -> RwLockWriteGuard<'_, FileLog> {
        self.files.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the file log
    #[must_use]
    pub fn file_log(&self) -> FileLog {
        self.files().clone()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files().len()
    }

    pub fn file(&self, file_id: &FileId) -> Result<Arc<FileRecord>> {
        self.files()
            .get(file_id)
            .ok_or_else(|| IngestError::not_found(format!("file {file_id}")))
    }

    /// Filename of each live file linked to `atom`, in first-association order
    #[must_use]
    pub fn owning_filenames(&self, atom: &Atom) -> Vec<String> {
        let files = self.files();
        atom.owning_files()
            .filter_map(|id| files.filename(id).map(str::to_string))
            .collect()
    }

    pub async fn ingest_bytes(&self, filename: impl Into<String>, data: Vec<u8>) -> Result<FileRecord> {
        self.ingest_bytes_cancellable(filename, data, &CancelToken::new())
            .await
    }

    pub async fn ingest_bytes_cancellable(
        &self,
        filename: impl Into<String>,
        data: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<FileRecord> {
        let filename = validate_filename(filename.into())?;
        self.check_size(&filename, data.len() as u64)?;
        self.run(filename, Source::Bytes(data), cancel).await
    }

    pub async fn ingest_path(&self, path: impl AsRef<Path>) -> Result<FileRecord> {
        let path = path.as_ref();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(IngestError::not_found(format!("file {}", path.display())));
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Err(IngestError::invalid_input(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let filename = validate_filename(filename)?;
        self.check_size(&filename, metadata.len())?;
        self.run(filename, Source::Path(path.to_path_buf()), &CancelToken::new())
            .await
    }

    /// Ingest a batch concurrently; results keep the input order.
    ///
    /// At most `batch_concurrency` inputs of the batch run at once, and
    /// every one of them still takes a process-wide ingestion slot.
    pub async fn ingest_many<I>(&self, inputs: I) -> Vec<Result<FileRecord>>
    where
        I: IntoIterator,
        I::Item: Into<IngestSource>,
    {
        let inputs: Vec<IngestSource> = inputs.into_iter().map(Into::into).collect();
        let count = inputs.len();
        let snapshot = ingest_concurrency_snapshot();
        log::debug!(
            "Ingesting {count} inputs, {} at a time ({} of {} process slots busy)",
            self.config.batch_concurrency,
            snapshot.in_flight,
            snapshot.limit
        );

        let limit = Arc::new(Semaphore::new(self.config.batch_concurrency));
        let mut tasks = JoinSet::new();
        for (position, input) in inputs.into_iter().enumerate() {
            let pipeline = self.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _slot = limit.acquire_owned().await;
                let result = match input {
                    IngestSource::Bytes { filename, data } => {
                        pipeline.ingest_bytes(filename, data).await
                    }
                    IngestSource::Path(path) => pipeline.ingest_path(path).await,
                };
                (position, result)
            });
        }

        let mut results: Vec<Option<Result<FileRecord>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(err) => log::error!("Ingestion task failed: {err}"),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| Err(IngestError::internal("ingestion task did not finish")))
            })
            .collect()
    }

    fn check_size(&self, filename: &str, size: u64) -> Result<()> {
        if size > self.config.max_file_size {
            return Err(IngestError::invalid_input(format!(
                "{filename} is {size} bytes, the limit is {}",
                self.config.max_file_size
            )));
        }
        Ok(())
    }

    async fn run(&self, filename: String, source: Source, cancel: &CancelToken) -> Result<FileRecord> {
        let _permit = acquire_ingest_permit().await?;
        let mut run = Ingestion {
            pipeline: self,
            filename: &filename,
            cancel,
            tracker: StateTracker::new(&filename),
            ledger: AcquisitionLedger::new(self.store.clone()),
            started: Instant::now(),
        };

        match run.execute(source).await {
            Ok(record) => {
                run.tracker.advance(IngestState::Done);
                log::info!(
                    "Ingested {} as {}: {} bytes, {} atoms ({} new, {} reused) in {} ms",
                    record.filename,
                    record.file_id,
                    record.total_size,
                    record.atom_sequence.len(),
                    record.atoms_created,
                    record.atoms_reused,
                    record.processing_time_ms
                );
                Ok(record)
            }
            Err(err) => {
                let state = run.tracker.current().clone();
                let orphaned = run.ledger.rollback();
                let err = match err {
                    cancelled @ IngestError::Cancelled { .. } => {
                        log::info!("{filename}: cancelled while {state}, {orphaned} atoms orphaned");
                        run.tracker.advance(IngestState::Failed("cancelled".to_string()));
                        cancelled
                    }
                    other => {
                        let reason = other.to_string();
                        log::warn!("{filename}: failed while {state}: {reason}");
                        run.tracker.advance(IngestState::Failed(reason.clone()));
                        IngestError::Failed {
                            filename: filename.clone(),
                            state,
                            reason,
                        }
                    }
                };
                Err(err)
            }
        }
    }

    /// Unlink every atom of a file and drop its record
    pub fn delete_file(&self, file_id: &FileId) -> Result<DeleteOutcome> {
        let record = {
            let mut files = self.files_mut();
            let record = files
                .remove(file_id)
                .ok_or_else(|| IngestError::not_found(format!("file {file_id}")))?;
            self.stats.forget(&record);
            record
        };

        let mut outcome = DeleteOutcome {
            file_id: file_id.clone(),
            atoms_unlinked: 0,
            orphaned: 0,
        };
        for (fingerprint, _) in record.reference_counts() {
            match self.store.unlink_file(&fingerprint, file_id) {
                Ok(unlinked) => {
                    outcome.atoms_unlinked += 1;
                    if unlinked.orphaned {
                        outcome.orphaned += 1;
                    }
                }
                Err(err) => log::warn!("Deleting {file_id}: {err}"),
            }
        }

        log::info!(
            "Deleted {file_id} ({}): {} atoms unlinked, {} orphaned",
            record.filename,
            outcome.atoms_unlinked,
            outcome.orphaned
        );
        Ok(outcome)
    }

    /// Reassemble a whole file from its atoms
    pub async fn read_file(&self, file_id: &FileId) -> Result<Vec<u8>> {
        self.read_range(file_id, 0, u64::MAX).await
    }

    /// Reassemble `len` bytes starting at `offset`; reads past the end are
    /// truncated
    pub async fn read_range(&self, file_id: &FileId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let record = self.file(file_id)?;
        if offset > record.total_size {
            return Err(IngestError::invalid_input(format!(
                "offset {offset} is past the end of {file_id} ({} bytes)",
                record.total_size
            )));
        }

        let end = offset.saturating_add(len).min(record.total_size);
        let mut out = Vec::with_capacity((end - offset) as usize);
        if offset == end {
            return Ok(out);
        }

        let first = record.atom_sequence.partition_point(|atom| atom.end() <= offset);
        for atom in &record.atom_sequence[first..] {
            if atom.offset >= end {
                break;
            }
            let payload = self.store.read_payload(&atom.fingerprint).await?;
            let from = offset.saturating_sub(atom.offset) as usize;
            let to = (end.min(atom.end()) - atom.offset) as usize;
            out.extend_from_slice(&payload[from..to]);
        }
        Ok(out)
    }

    /// Per-atom breakdown of a file with current reuse counts
    pub fn breakdown(&self, file_id: &FileId) -> Result<FileBreakdown> {
        let record = self.file(file_id)?;
        Ok(self.breakdown_of(&record))
    }

    /// Breakdown of the oldest live file with this whole-file fingerprint
    pub fn breakdown_by_fingerprint(&self, raw: &str) -> Result<FileBreakdown> {
        let fingerprint = Fingerprint::parse(raw)?;
        let record = self
            .files()
            .find_by_fingerprint(&fingerprint)
            .ok_or_else(|| IngestError::not_found(format!("file with fingerprint {fingerprint}")))?;
        Ok(self.breakdown_of(&record))
    }

    fn breakdown_of(&self, record: &FileRecord) -> FileBreakdown {
        let mut usage: HashMap<&Fingerprint, u64> = HashMap::new();
        let atoms = record
            .atom_sequence
            .iter()
            .map(|atom| {
                let reuse_count = *usage.entry(&atom.fingerprint).or_insert_with(|| {
                    self.store
                        .get(&atom.fingerprint)
                        .map_or(0, |stored| stored.usage_count)
                });
                AtomUsage {
                    fingerprint: atom.fingerprint.clone(),
                    offset: atom.offset,
                    size: atom.size,
                    is_new: atom.is_new,
                    reuse_count,
                }
            })
            .collect();

        FileBreakdown {
            file_id: record.file_id.clone(),
            filename: record.filename.clone(),
            fingerprint: record.fingerprint.clone(),
            total_size: record.total_size,
            atoms,
        }
    }

    /// Current statistics; `top` defaults to the configured length
    #[must_use]
    pub fn stats(&self, top: Option<usize>) -> DedupStats {
        let top = top.unwrap_or(self.config.top_atoms).min(MAX_TOP_ATOMS);
        self.stats.snapshot(top)
    }

    /// Evict orphaned atoms
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        Ok(self.store.collect_garbage().await?)
    }

    fn reconcile_stats(&self) -> ReconcileReport {
        let files = self.files();
        self.stats.reconcile(&self.store, &files)
    }

    /// Check store invariants and payloads, then rebuild statistics from
    /// scratch
    pub async fn verify(&self) -> VerifyReport {
        let invariants = self.store.verify().await;
        let stats = self.reconcile_stats();
        VerifyReport { invariants, stats }
    }
}

fn validate_filename(filename: String) -> Result<String> {
    if filename.trim().is_empty() {
        return Err(IngestError::invalid_input("filename must not be empty"));
    }
    Ok(filename)
}

/// Read a whole file, hashing it block by block as it arrives
fn read_and_fingerprint(path: &Path) -> std::io::Result<(Vec<u8>, Fingerprint)> {
    let mut file = std::fs::File::open(path)?;
    let expected = file.metadata().map_or(0, |metadata| metadata.len());
    let mut data = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
    let mut hasher = IncrementalHasher::new();
    let mut block = vec![0u8; READ_BLOCK_SIZE];
    loop {
        let read = match file.read(&mut block) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&block[..read]);
        data.extend_from_slice(&block[..read]);
    }
    Ok((data, hasher.finalize()))
}

/// One ingestion in progress
struct Ingestion<'a> {
    pipeline: &'a IngestionPipeline,
    filename: &'a str,
    cancel: &'a CancelToken,
    tracker: StateTracker<'a>,
    ledger: AcquisitionLedger,
    started: Instant,
}

impl Ingestion<'_> {
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                filename: self.filename.to_string(),
                state: self.tracker.current().clone(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, next: IngestState) -> Result<()> {
        self.checkpoint()?;
        self.tracker.advance(next);
        Ok(())
    }

    async fn execute(&mut self, source: Source) -> Result<FileRecord> {
        self.checkpoint()?;
        let (data, read_fingerprint): (Arc<[u8]>, Option<Fingerprint>) = match source {
            Source::Bytes(data) => (data.into(), None),
            Source::Path(path) => {
                let (data, whole) =
                    tokio::task::spawn_blocking(move || read_and_fingerprint(&path)).await??;
                (data.into(), Some(whole))
            }
        };

        self.advance(IngestState::Chunking)?;
        let whole = match read_fingerprint {
            Some(whole) => whole,
            None => {
                let data = data.clone();
                tokio::task::spawn_blocking(move || fingerprint(&data)).await?
            }
        };
        let layout = match self.reusable_layout(&whole, data.len() as u64) {
            Some(layout) => layout,
            None => self.chunk_and_hash(&data).await?,
        };

        self.advance(IngestState::StoreLookup)?;
        let image = AtomKind::is_image(&data);
        let mut atom_sequence = Vec::with_capacity(layout.len());
        let mut atoms: Vec<Atom> = Vec::new();
        let mut seen: HashSet<Fingerprint> = HashSet::new();
        for (span, fp) in &layout {
            self.checkpoint()?;
            let bytes = &data[span.offset..span.end()];
            let kind = if image {
                AtomKind::Image
            } else {
                AtomKind::classify(bytes)
            };

            let (atom, is_new) = self.pipeline.store.get_or_create(fp, bytes, kind).await?;
            self.ledger.acquired(fp);
            atom_sequence.push(AtomRef {
                fingerprint: fp.clone(),
                offset: span.offset as u64,
                size: span.len as u64,
                is_new,
            });
            if seen.insert(fp.clone()) {
                atoms.push(atom);
            }
        }

        self.advance(IngestState::Linking)?;
        let file_id = self.pipeline.files_mut().allocate_id();
        let atoms_created = atom_sequence.iter().filter(|atom| atom.is_new).count();
        let mut record = FileRecord {
            file_id: file_id.clone(),
            filename: self.filename.to_string(),
            total_size: data.len() as u64,
            fingerprint: whole,
            atoms_reused: atom_sequence.len() - atoms_created,
            atom_sequence,
            atoms_created,
            ingested_at: Utc::now(),
            processing_time_ms: 0,
        };
        record.validate().map_err(IngestError::internal)?;

        self.ledger.file_id = Some(file_id.clone());
        for (fp, references) in record.reference_counts() {
            if !self.pipeline.store.link_file(&fp, &file_id, references)? {
                return Err(IngestError::internal(format!(
                    "atom {fp} was already linked to {file_id}"
                )));
            }
            self.ledger.linked(&fp, references);
        }

        self.tracker.advance(IngestState::Finalizing);
        record.processing_time_ms = self.started.elapsed().as_millis() as u64;
        {
            let mut files = self.pipeline.files_mut();
            files.insert(record.clone());
            self.pipeline.stats.record(&record, &atoms);
        }
        self.ledger.commit();
        Ok(record)
    }

    /// Atom layout of a live file with identical content
    fn reusable_layout(&self, whole: &Fingerprint, size: u64) -> Option<Vec<(ChunkSpan, Fingerprint)>> {
        if !self.pipeline.config.whole_file_fast_path {
            return None;
        }
        let existing = self.pipeline.files().find_by_fingerprint(whole)?;
        if existing.total_size != size {
            return None;
        }
        log::debug!(
            "{}: same content as {}, reusing its layout",
            self.filename,
            existing.file_id
        );
        Some(
            existing
                .atom_sequence
                .iter()
                .map(|atom| {
                    (
                        ChunkSpan::new(atom.offset as usize, atom.size as usize),
                        atom.fingerprint.clone(),
                    )
                })
                .collect(),
        )
    }

    async fn chunk_and_hash(&mut self, data: &Arc<[u8]>) -> Result<Vec<(ChunkSpan, Fingerprint)>> {
        let spans = {
            let chunker = self.pipeline.chunker.clone();
            let data = data.clone();
            tokio::task::spawn_blocking(move || chunker.spans(&data).collect::<Vec<_>>()).await?
        };

        self.advance(IngestState::Hashing)?;
        let data = data.clone();
        let layout = tokio::task::spawn_blocking(move || {
            spans
                .into_iter()
                .map(|span| {
                    let fp = fingerprint(&data[span.offset..span.end()]);
                    (span, fp)
                })
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(layout)
    }
}

/// References acquired by one ingestion, undone unless committed.
///
/// Rollback runs on error and on drop, so a cancelled ingestion leaves no
/// stray references behind. Atoms that drop to zero become orphans.
struct AcquisitionLedger {
    store: Arc<AtomStore>,
    unclaimed: HashMap<Fingerprint, u64>,
    linked: Vec<Fingerprint>,
    file_id: Option<FileId>,
}

impl AcquisitionLedger {
    fn new(store: Arc<AtomStore>) -> Self {
        Self {
            store,
            unclaimed: HashMap::new(),
            linked: Vec::new(),
            file_id: None,
        }
    }

    fn acquired(&mut self, fingerprint: &Fingerprint) {
        *self.unclaimed.entry(fingerprint.clone()).or_default() += 1;
    }

    fn linked(&mut self, fingerprint: &Fingerprint, references: u64) {
        if let Some(count) = self.unclaimed.get_mut(fingerprint) {
            *count = count.saturating_sub(references);
            if *count == 0 {
                self.unclaimed.remove(fingerprint);
            }
        }
        self.linked.push(fingerprint.clone());
    }

    fn commit(&mut self) {
        self.unclaimed.clear();
        self.linked.clear();
    }

    fn is_empty(&self) -> bool {
        self.unclaimed.is_empty() && self.linked.is_empty()
    }

    /// Undo every acquisition; returns the number of atoms orphaned
    fn rollback(&mut self) -> usize {
        let mut orphaned = 0;

        if let Some(file_id) = &self.file_id {
            for fp in self.linked.drain(..) {
                match self.store.unlink_file(&fp, file_id) {
                    Ok(outcome) if outcome.orphaned => orphaned += 1,
                    Ok(_) => {}
                    Err(err) => log::warn!("Rollback: unlink {fp} from {file_id}: {err}"),
                }
            }
        }
        self.linked.clear();

        for (fp, count) in self.unclaimed.drain() {
            for _ in 0..count {
                match self.store.release(&fp) {
                    Ok(outcome) if outcome.orphaned => orphaned += 1,
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("Rollback: release {fp}: {err}");
                        break;
                    }
                }
            }
        }
        orphaned
    }
}

impl Drop for AcquisitionLedger {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        let orphaned = self.rollback();
        log::debug!("Rolled back an interrupted ingestion ({orphaned} atoms orphaned)");
    }
}
