use crate::error::{IngestError, Result};
use atomstore_chunker::ChunkerConfig;
use atomstore_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of atoms reported in `top_atoms`
pub const DEFAULT_TOP_ATOMS: usize = 10;

/// Upper bound on `top_atoms`
pub const MAX_TOP_ATOMS: usize = 1000;

/// Ingestion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reuse the atom layout of a live file with the same whole-file
    /// fingerprint instead of chunking and hashing again
    pub whole_file_fast_path: bool,

    /// Largest accepted file, in bytes
    pub max_file_size: u64,

    /// Files `ingest_many` keeps in flight at once
    pub batch_concurrency: usize,

    /// Default length of `top_atoms`
    pub top_atoms: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            whole_file_fast_path: true,
            max_file_size: 1024 * 1024 * 1024,
            batch_concurrency: 4,
            top_atoms: DEFAULT_TOP_ATOMS,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_file_size == 0 {
            return Err("pipeline.max_file_size must be > 0".to_string());
        }
        if self.batch_concurrency == 0 {
            return Err("pipeline.batch_concurrency must be > 0".to_string());
        }
        if self.top_atoms == 0 || self.top_atoms > MAX_TOP_ATOMS {
            return Err(format!(
                "pipeline.top_atoms must be between 1 and {MAX_TOP_ATOMS}, got {}",
                self.top_atoms
            ));
        }
        Ok(())
    }
}

/// Everything needed to open a store, loadable from TOML:
///
/// ```toml
/// [chunker]
/// target_size = 4096
///
/// [store]
/// shards = 32
///
/// [pipeline]
/// whole_file_fast_path = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomstoreConfig {
    pub chunker: ChunkerConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
}

impl AtomstoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| IngestError::invalid_config(format!("TOML parse error: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            IngestError::invalid_config(format!("read config {}: {err}", path.display()))
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunker.validate().map_err(IngestError::invalid_config)?;
        self.store.validate().map_err(IngestError::invalid_config)?;
        self.pipeline.validate().map_err(IngestError::invalid_config)?;
        Ok(())
    }

    /// Apply `ATOMSTORE_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = get("ATOMSTORE_SHARDS") {
            self.store.shards = parse_override("ATOMSTORE_SHARDS", &raw)?;
        }
        if let Some(raw) = get("ATOMSTORE_FAST_PATH") {
            self.pipeline.whole_file_fast_path = parse_flag("ATOMSTORE_FAST_PATH", &raw)?;
        }
        if let Some(raw) = get("ATOMSTORE_MAX_FILE_SIZE") {
            self.pipeline.max_file_size = parse_override("ATOMSTORE_MAX_FILE_SIZE", &raw)?;
        }
        if let Some(raw) = get("ATOMSTORE_TOP_ATOMS") {
            self.pipeline.top_atoms = parse_override("ATOMSTORE_TOP_ATOMS", &raw)?;
        }
        if let Some(raw) = get("ATOMSTORE_CHUNK_TARGET_SIZE") {
            self.chunker.target_size = parse_override("ATOMSTORE_CHUNK_TARGET_SIZE", &raw)?;
        }

        self.validate()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| IngestError::invalid_config(format!("{key}: cannot parse '{raw}'")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IngestError::invalid_config(format!(
            "{key}: expected a boolean, got '{raw}'"
        ))),
    }
}
