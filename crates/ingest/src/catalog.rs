//! On-disk layout of a store directory.
//!
//! ```text
//! <store>/
//!   catalog.json   atom metadata + file log (JSON snapshot)
//!   store.lock     exclusive lock held by mutating commands
//!   atoms/         payloads, content-addressed (see FsPayloadStore)
//! ```

use crate::config::AtomstoreConfig;
use crate::error::{IngestError, Result};
use crate::file_log::FileLog;
use crate::pipeline::IngestionPipeline;
use crate::record::FileRecord;
use atomstore_store::{Atom, AtomStore, FsPayloadStore};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CATALOG_SCHEMA_VERSION: u32 = 1;

const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "store.lock";
const PAYLOAD_DIR: &str = "atoms";

/// Snapshot of atom metadata and the file log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub schema_version: u32,
    pub next_file_seq: u64,
    pub atoms: Vec<Atom>,
    pub files: Vec<FileRecord>,
}

impl Catalog {
    /// Capture the pipeline's current state. References held by in-flight
    /// ingestions are not included.
    #[must_use]
    pub fn capture(pipeline: &IngestionPipeline) -> Self {
        let files = pipeline.file_log();
        Self {
            schema_version: CATALOG_SCHEMA_VERSION,
            next_file_seq: files.next_seq(),
            atoms: pipeline.store().snapshot(),
            files: files.records().map(|record| (**record).clone()).collect(),
        }
    }

    /// Load a catalog; `None` when the file does not exist yet
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let catalog: Self = serde_json::from_slice(&bytes)?;
        if catalog.schema_version != CATALOG_SCHEMA_VERSION {
            return Err(IngestError::Catalog(format!(
                "Unsupported catalog schema_version {} (expected {CATALOG_SCHEMA_VERSION})",
                catalog.schema_version
            )));
        }
        Ok(Some(catalog))
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Build a pipeline over this catalog and the given payloads
    pub fn into_pipeline(
        self,
        config: &AtomstoreConfig,
        payloads: Arc<dyn atomstore_store::PayloadStore>,
    ) -> Result<IngestionPipeline> {
        let store = AtomStore::new(config.store.clone(), payloads)?;
        store.restore(self.atoms)?;
        let files =
            FileLog::from_records(self.files, self.next_file_seq).map_err(IngestError::Catalog)?;
        IngestionPipeline::with_file_log(
            config.chunker.clone(),
            Arc::new(store),
            files,
            config.pipeline.clone(),
        )
    }
}

/// A store directory on disk
#[derive(Debug, Clone)]
pub struct StoreDir {
    root: PathBuf,
}

impl StoreDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    #[must_use]
    pub fn payload_dir(&self) -> PathBuf {
        self.root.join(PAYLOAD_DIR)
    }

    /// Open the store, creating an empty one if the directory is new
    pub async fn open(&self, config: &AtomstoreConfig) -> Result<IngestionPipeline> {
        tokio::fs::create_dir_all(self.payload_dir()).await?;
        let payloads = Arc::new(FsPayloadStore::new(self.payload_dir()));

        match Catalog::load(self.catalog_path()).await? {
            Some(catalog) => {
                log::debug!(
                    "Opened {}: {} atoms, {} files",
                    self.root.display(),
                    catalog.atoms.len(),
                    catalog.files.len()
                );
                catalog.into_pipeline(config, payloads)
            }
            None => {
                log::debug!("Initializing new store at {}", self.root.display());
                let store = AtomStore::new(config.store.clone(), payloads)?;
                IngestionPipeline::new(
                    config.chunker.clone(),
                    Arc::new(store),
                    config.pipeline.clone(),
                )
            }
        }
    }

    pub async fn save(&self, pipeline: &IngestionPipeline) -> Result<()> {
        Catalog::capture(pipeline).save(self.catalog_path()).await
    }

    /// Take the exclusive lock for mutating commands
    pub async fn lock(&self) -> Result<StoreLock> {
        acquire_store_lock(&self.root.join(LOCK_FILE)).await
    }
}

/// Exclusive lock on a store directory, released on drop
pub struct StoreLock {
    #[allow(dead_code)]
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

async fn acquire_store_lock(path: &Path) -> Result<StoreLock> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let path = path.to_path_buf();
    let lock = tokio::task::spawn_blocking(move || -> Result<StoreLock> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                IngestError::internal(format!("open store lock {}: {err}", path.display()))
            })?;

        file.lock_exclusive().map_err(|err| {
            IngestError::internal(format!("acquire store lock {}: {err}", path.display()))
        })?;

        Ok(StoreLock { file })
    })
    .await??;

    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomstore_chunker::ChunkerConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn small_config() -> AtomstoreConfig {
        AtomstoreConfig {
            chunker: ChunkerConfig::small(),
            ..AtomstoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_catalog_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(Catalog::load(dir.path().join("catalog.json"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_schema_version_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(
            &path,
            r#"{"schema_version": 99, "next_file_seq": 0, "atoms": [], "files": []}"#,
        )
        .await
        .unwrap();
        assert!(matches!(
            Catalog::load(&path).await.unwrap_err(),
            IngestError::Catalog(_)
        ));
    }

    #[tokio::test]
    async fn test_store_dir_round_trip() {
        let dir = TempDir::new().unwrap();
        let store_dir = StoreDir::new(dir.path().join("store"));
        let config = small_config();

        let pipeline = store_dir.open(&config).await.unwrap();
        let record = pipeline
            .ingest_bytes("notes.txt", b"some text worth keeping around".repeat(40))
            .await
            .unwrap();
        store_dir.save(&pipeline).await.unwrap();
        let before = pipeline.stats(None);
        drop(pipeline);

        let reopened = store_dir.open(&config).await.unwrap();
        assert_eq!(reopened.stats(None), before);
        assert_eq!(
            reopened.read_file(&record.file_id).await.unwrap(),
            b"some text worth keeping around".repeat(40)
        );
        assert!(reopened.verify().await.is_ok());

        let next = reopened.ingest_bytes("more.txt", b"x".to_vec()).await.unwrap();
        assert_ne!(next.file_id, record.file_id);
    }

    #[tokio::test]
    async fn test_lock_can_be_retaken_after_drop() {
        let dir = TempDir::new().unwrap();
        let store_dir = StoreDir::new(dir.path());
        let lock = store_dir.lock().await.unwrap();
        drop(lock);
        let _again = store_dir.lock().await.unwrap();
    }
}
