use atomstore_ingest::IngestError;
use atomstore_protocol::{ErrorCode, ErrorEnvelope};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize)]
pub struct CommandRequest {
    pub action: CommandAction,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    SearchAtoms,
    AtomDetail,
    DedupStats,
    AnalyzeFile,
    FileAtoms,
    DeleteFile,
    Gc,
    Verify,
}

impl CommandAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandAction::SearchAtoms => "search_atoms",
            CommandAction::AtomDetail => "atom_detail",
            CommandAction::DedupStats => "dedup_stats",
            CommandAction::AnalyzeFile => "analyze_file",
            CommandAction::FileAtoms => "file_atoms",
            CommandAction::DeleteFile => "delete_file",
            CommandAction::Gc => "gc",
            CommandAction::Verify => "verify",
        }
    }

    /// Actions that change the store and must hold its lock
    pub const fn mutates(self) -> bool {
        matches!(
            self,
            CommandAction::AnalyzeFile | CommandAction::DeleteFile | CommandAction::Gc
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: CommandStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    #[serde(default)]
    pub meta: ResponseMeta,
}

impl CommandResponse {
    pub fn ok(data: Value, meta: ResponseMeta) -> Self {
        Self {
            status: CommandStatus::Ok,
            data,
            error: None,
            meta,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, meta: ResponseMeta) -> Self {
        Self {
            status: CommandStatus::Error,
            data: Value::Null,
            error: Some(ErrorEnvelope {
                code,
                message: message.into(),
            }),
            meta,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, CommandStatus::Error)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchPayload {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HashPayload {
    pub hash: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct StatsPayload {
    #[serde(default)]
    pub top: Option<usize>,
}

/// Either a path on disk or inline content
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct AnalyzePayload {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_base64: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeletePayload {
    pub file_id: String,
}

pub fn parse_payload<T: DeserializeOwned>(action: CommandAction, payload: Value) -> anyhow::Result<T> {
    serde_json::from_value(payload).map_err(|err| {
        IngestError::invalid_input(format!("invalid payload for {}: {err}", action.as_str())).into()
    })
}

/// Error code for a failed command. Only not-found and invalid-input
/// failures are reported as such; everything else is internal.
pub fn classify_error(err: &anyhow::Error) -> ErrorCode {
    match err.downcast_ref::<IngestError>() {
        Some(IngestError::NotFound(_)) => ErrorCode::NotFound,
        Some(IngestError::InvalidInput(_)) => ErrorCode::InvalidInput,
        _ => ErrorCode::Internal,
    }
}
