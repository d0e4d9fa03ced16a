//! # atomstore chunker
//!
//! Content-defined chunking for the atom store.
//!
//! ## Philosophy
//!
//! Atoms are cut where the content says so, not at fixed offsets:
//! - A Buzhash rolling hash over a small window marks candidate boundaries
//! - Boundaries below `min_size` are ignored, `max_size` forces a cut
//! - An insertion early in a file only disturbs the atoms around it, so the
//!   rest of the file still deduplicates against earlier versions
//!
//! ## Architecture
//!
//! ```text
//! File bytes
//!     │
//!     ├──> Rolling hash (window_size bytes)
//!     │      └─> hash & mask == 0 → boundary candidate
//!     │
//!     ├──> Size bounds
//!     │      ├─> len < min_size  → keep scanning
//!     │      └─> len == max_size → forced cut
//!     │
//!     └──> Spans
//!            └─> (offset, len) in stream order, no gaps, no overlaps
//! ```
//!
//! ## Example
//!
//! ```rust
//! use atomstore_chunker::{Chunker, ChunkerConfig};
//!
//! let chunker = Chunker::new(ChunkerConfig::small()).unwrap();
//! let data = vec![7u8; 10_000];
//!
//! let mut covered = 0;
//! for span in chunker.spans(&data) {
//!     assert_eq!(span.offset, covered);
//!     covered += span.len;
//! }
//! assert_eq!(covered, data.len());
//! ```

mod chunker;
mod config;
mod error;
mod types;

pub use chunker::{Chunker, Spans};
pub use config::ChunkerConfig;
pub use error::{ChunkerError, Result};
pub use types::{Chunk, ChunkSpan};
