//! # Atomstore Ingest
//!
//! Ingestion pipeline and deduplication statistics on top of the atom store.
//!
//! ## Pipeline
//!
//! ```text
//! File bytes
//!     │
//!     ├──> Chunker (content-defined boundaries)
//!     │      └─> Spans
//!     │
//!     ├──> Hasher (SHA-256 per span)
//!     │      └─> Fingerprints
//!     │
//!     ├──> AtomStore::get_or_create  (new | reused)
//!     │
//!     ├──> link file ↔ atoms
//!     │
//!     └──> FileLog + StatsAggregator
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use atomstore_ingest::{AtomstoreConfig, StoreDir};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = StoreDir::new(".atomstore");
//!     let pipeline = dir.open(&AtomstoreConfig::default()).await?;
//!
//!     let record = pipeline.ingest_path("report.pdf").await?;
//!     println!(
//!         "{}: {} new atoms, {} reused",
//!         record.file_id, record.atoms_created, record.atoms_reused
//!     );
//!
//!     dir.save(&pipeline).await?;
//!     Ok(())
//! }
//! ```

mod catalog;
mod config;
mod error;
mod file_log;
mod limits;
mod pipeline;
mod query;
mod record;
mod state;
mod stats;

pub use catalog::{Catalog, StoreDir, StoreLock, CATALOG_SCHEMA_VERSION};
pub use config::{AtomstoreConfig, PipelineConfig, DEFAULT_TOP_ATOMS, MAX_TOP_ATOMS};
pub use error::{IngestError, Result};
pub use file_log::FileLog;
pub use limits::{ingest_concurrency_snapshot, IngestConcurrencySnapshot};
pub use pipeline::{
    AtomUsage, CancelToken, DeleteOutcome, FileBreakdown, IngestSource, IngestionPipeline,
    VerifyReport,
};
pub use query::{AtomDetail, AtomSearch, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT, MIN_QUERY_LEN};
pub use record::{AtomRef, FileRecord};
pub use state::IngestState;
pub use stats::{DedupStats, ReconcileReport, StatsAggregator, TopAtom};
