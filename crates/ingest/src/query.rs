use crate::error::{IngestError, Result};
use crate::pipeline::IngestionPipeline;
use atomstore_store::{is_hex_prefix, Atom, Fingerprint};
use serde::{Deserialize, Serialize};

/// Queries shorter than this return nothing
pub const MIN_QUERY_LEN: usize = 3;
pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

/// Matching atoms plus the total number of matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomSearch {
    pub atoms: Vec<AtomDetail>,
    pub total: usize,
}

/// An atom with the names of the files it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomDetail {
    pub atom: Atom,
    pub files: Vec<String>,
}

impl IngestionPipeline {
    /// Prefix search over atom fingerprints.
    ///
    /// The query is trimmed and lowercased. Empty or non-hex queries are
    /// rejected; queries below [`MIN_QUERY_LEN`] match nothing.
    pub fn search_atoms(&self, query: &str, limit: Option<usize>) -> Result<AtomSearch> {
        let query = query.trim().to_ascii_lowercase();
        if query.is_empty() {
            return Err(IngestError::invalid_input("search query must not be empty"));
        }
        if !is_hex_prefix(&query) {
            return Err(IngestError::invalid_input(format!(
                "search query must be a hex fingerprint prefix: {query}"
            )));
        }
        if query.len() < MIN_QUERY_LEN {
            return Ok(AtomSearch {
                atoms: Vec::new(),
                total: 0,
            });
        }

        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT);
        let page = self.store().scan_prefix(&query, limit)?;
        let atoms = page
            .atoms
            .into_iter()
            .map(|atom| self.detail_of(atom))
            .collect();
        Ok(AtomSearch {
            atoms,
            total: page.total,
        })
    }

    /// One atom by full fingerprint
    pub fn atom_detail(&self, hash: &str) -> Result<AtomDetail> {
        let fingerprint = Fingerprint::parse(hash)?;
        let atom = self.store().get(&fingerprint)?;
        Ok(self.detail_of(atom))
    }

    fn detail_of(&self, atom: Atom) -> AtomDetail {
        let files = self.owning_filenames(&atom);
        AtomDetail { atom, files }
    }
}
