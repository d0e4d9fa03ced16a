//! # Atom Store
//!
//! Content-addressed storage for deduplicated atoms, with exact reference
//! counting.
//!
//! ## Features
//!
//! - **SHA-256 fingerprints** identify atoms by content
//! - **Exactly one creator** per fingerprint under concurrent ingestion
//! - **Reference counts** split between file owners and in-flight acquisitions
//! - **Prefix search** over an ordered index kept in lock-step with the store
//! - **Pluggable payloads**: in memory or a content-addressed directory tree
//! - **Explicit eviction** of orphaned atoms
//!
//! ## Architecture
//!
//! ```text
//! bytes
//!   │
//!   ├──> fingerprint() ──> Fingerprint (64 hex chars)
//!   │
//!   └──> AtomStore::get_or_create
//!          ├─> shard[fp[0] % N]   (metadata, Pending → Ready → Evicting)
//!          ├─> QueryIndex          (visible fingerprints, ordered)
//!          └─> PayloadStore        (bytes, written outside any lock)
//! ```
//!
//! ## Example
//!
//! ```
//! use atomstore_store::{fingerprint, AtomKind, AtomStore, FileId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> atomstore_store::Result<()> {
//! let store = AtomStore::in_memory();
//! let data = b"hello atoms";
//! let fp = fingerprint(data);
//!
//! let (atom, created) = store.get_or_create(&fp, data, AtomKind::Text).await?;
//! assert!(created);
//! store.link_file(&fp, &FileId::from_sequence(1), 1)?;
//!
//! assert_eq!(store.get(&fp)?.usage_count, atom.usage_count);
//! assert!(store.verify().await.is_quiescent());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod hasher;
mod index;
mod payload;
mod store;
mod types;

pub use config::{RetryPolicy, StoreConfig, MAX_SHARDS};
pub use error::{Result, StoreError};
pub use hasher::{fingerprint, is_hex_prefix, Fingerprint, IncrementalHasher, FINGERPRINT_HEX_LEN};
pub use index::QueryIndex;
pub use payload::{FsPayloadStore, MemoryPayloadStore, PayloadStore};
pub use store::AtomStore;
pub use types::{
    Atom, AtomKind, AtomOwner, EvictedAtom, FileId, GcReport, InvariantReport, PrefixScan,
    ReleaseOutcome, UnlinkOutcome,
};
