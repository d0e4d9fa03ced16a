//! JSON shapes returned by the atomstore command API.
//!
//! These are the views the dashboards consume. They carry plain strings and
//! numbers only, so clients never need the store's internal types.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const COMMAND_API_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
}

/// One atom as the explorer shows it
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AtomView {
    pub hash: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
    /// Filenames in first-association order
    pub files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub atoms: Vec<AtomView>,
    pub total: usize,
}

/// Outcome of ingesting one file
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadResult {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub atoms_created: usize,
    pub atoms_reused: usize,
    /// Reused bytes over file size
    pub dedup_ratio: f64,
    pub storage_saved: u64,
    /// Whole-file fingerprint
    pub hash: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileAtom {
    pub hash: String,
    pub size: u64,
    pub is_new: bool,
    pub reuse_count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileAtomsResponse {
    pub atoms: Vec<FileAtom>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TopAtomView {
    pub hash: String,
    pub usage_count: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DedupStatsView {
    pub total_files: u64,
    pub total_size: u64,
    pub total_atoms: u64,
    pub unique_atoms: u64,
    pub physical_size: u64,
    pub storage_saved: u64,
    pub dedup_ratio: f64,
    pub avg_reuse: f64,
    pub top_atoms: Vec<TopAtomView>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub file_id: String,
    pub atoms_unlinked: usize,
    pub orphaned: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GcResult {
    pub evicted: usize,
    pub bytes_freed: u64,
    /// Orphans or stray payloads that could not be removed this time
    pub deferred: usize,
    /// Payloads removed because no atom referred to them
    #[serde(default)]
    pub stray_payloads: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub ok: bool,
    pub atoms_checked: usize,
    pub orphans: usize,
    pub unclaimed_references: u64,
    pub violations: Vec<String>,
    pub stats_drift: Vec<String>,
    pub store_mismatches: Vec<String>,
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn atom_view_uses_dashboard_field_names() {
        let view = AtomView {
            hash: "ab".repeat(32),
            size: 12,
            kind: "text".to_string(),
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            usage_count: 3,
            files: vec!["a.txt".to_string()],
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["created_at"], "2024-05-01T10:00:00Z");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn error_codes_are_snake_case() {
        let envelope = ErrorEnvelope {
            code: ErrorCode::InvalidInput,
            message: "bad".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"code": "invalid_input", "message": "bad"})
        );
        assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
    }
}
