use crate::state::IngestState;
use atomstore_chunker::ChunkerError;
use atomstore_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Ingestion of '{filename}' failed while {state}: {reason}")]
    Failed {
        filename: String,
        state: IngestState,
        reason: String,
    },

    #[error("Ingestion of '{filename}' cancelled while {state}")]
    Cancelled {
        filename: String,
        state: IngestState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl IngestError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors a caller may show as-is; everything else is internal
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidInput(_))
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            StoreError::StoreUnavailable(msg) | StoreError::ConcurrencyConflict(msg) => {
                Self::StoreUnavailable(msg)
            }
        }
    }
}

impl From<ChunkerError> for IngestError {
    fn from(err: ChunkerError) -> Self {
        match err {
            ChunkerError::InvalidConfig(msg) => Self::InvalidConfig(msg),
        }
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Catalog(err.to_string())
    }
}
