//! Payload backends.
//!
//! The store keeps atom metadata itself and hands the bytes to a
//! [`PayloadStore`]. Backends are content-addressed: writing the same
//! fingerprint twice is a no-op, deleting a missing payload succeeds.

use crate::error::{Result, StoreError};
use crate::hasher::Fingerprint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store the bytes of an atom
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> Result<()>;

    /// Fetch the bytes of an atom; `NotFound` if absent
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;

    /// Remove the bytes of an atom
    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()>;

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Fingerprints of every stored payload, in no particular order
    async fn list(&self) -> Result<Vec<Fingerprint>>;
}

/// Payloads held in process memory
#[derive(Default)]
pub struct MemoryPayloadStore {
    payloads: RwLock<HashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryPayloadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> Result<()> {
        let mut payloads = self
            .payloads
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        payloads
            .entry(fingerprint.clone())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        self.payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("payload {fingerprint}")))
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.payloads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fingerprint);
        Ok(())
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self
            .payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(fingerprint))
    }

    async fn list(&self) -> Result<Vec<Fingerprint>> {
        Ok(self
            .payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

/// Payloads stored as files under a content-addressed directory tree:
///
/// ```text
/// <root>/
///   <first 2 hex chars>/
///     <next 2 hex chars>/
///       <remaining hex chars>
/// ```
pub struct FsPayloadStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsPayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a payload inside the tree
    #[must_use]
    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.as_str();
        self.root.join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
    }

    fn tmp_path_for(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("tmp.{}.{n}", std::process::id()))
    }
}

/// Names of the subdirectories (or files) of `dir`; a missing `dir` is empty
async fn children(dir: &Path, dirs: bool) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() != dirs {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            children.push((name.to_string(), entry.path()));
        }
    }
    Ok(children)
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> Result<()> {
        let path = self.path_for(fingerprint);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path_for(&path);
        if let Err(err) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        tokio::fs::rename(&tmp, &path).await?;
        log::trace!("Wrote payload {fingerprint} ({} bytes)", data.len());
        Ok(())
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(fingerprint)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(format!("payload {fingerprint}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(fingerprint)).await?)
    }

    /// Walks the tree; temp files and foreign names are skipped
    async fn list(&self) -> Result<Vec<Fingerprint>> {
        let mut found = Vec::new();
        for (first, first_dir) in children(&self.root, true).await? {
            for (second, second_dir) in children(&first_dir, true).await? {
                for (rest, _) in children(&second_dir, false).await? {
                    let hex = format!("{first}{second}{rest}");
                    match Fingerprint::parse(&hex) {
                        Ok(fp) if fp.as_str() == hex => found.push(fp),
                        _ => log::trace!("Skipping {hex} in payload tree"),
                    }
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let store = MemoryPayloadStore::new();
        let fp = fingerprint(b"payload");

        store.put(&fp, b"payload").await.unwrap();
        store.put(&fp, b"payload").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 7);
        assert_eq!(store.get(&fp).await.unwrap(), b"payload");

        store.delete(&fp).await.unwrap();
        assert!(!store.contains(&fp).await.unwrap());
        assert!(store.get(&fp).await.unwrap_err().is_not_found());
        store.delete(&fp).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_layout_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsPayloadStore::new(dir.path());
        let fp = fingerprint(b"on disk");

        store.put(&fp, b"on disk").await.unwrap();
        let path = store.path_for(&fp);
        let hex = fp.as_str();
        assert_eq!(
            path,
            dir.path().join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
        );
        assert!(path.exists());
        assert_eq!(store.get(&fp).await.unwrap(), b"on disk");

        // Content-addressed: a second put leaves the first file alone.
        store.put(&fp, b"on disk").await.unwrap();
        assert!(store.contains(&fp).await.unwrap());

        store.delete(&fp).await.unwrap();
        assert!(!path.exists());
        store.delete(&fp).await.unwrap();
        assert!(store.get(&fp).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fs_list_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = FsPayloadStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        let fp = fingerprint(b"listed");
        store.put(&fp, b"listed").await.unwrap();
        let leftover = store.path_for(&fp).with_extension("tmp.1.0");
        std::fs::write(&leftover, b"partial").unwrap();
        std::fs::write(dir.path().join("README"), b"not a payload").unwrap();

        assert_eq!(store.list().await.unwrap(), vec![fp]);
    }

    #[tokio::test]
    async fn test_fs_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FsPayloadStore::new(dir.path());
        for i in 0..8u8 {
            let data = vec![i; 32];
            store.put(&fingerprint(&data), &data).await.unwrap();
        }

        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let name = path.file_name().unwrap().to_string_lossy().to_string();
                    assert!(!name.contains(".tmp"), "leftover temp file {name}");
                }
            }
        }
    }
}
