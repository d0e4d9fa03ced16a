pub mod domain;
mod services;
mod views;

pub use domain::{
    classify_error, AnalyzePayload, CommandAction, CommandRequest, CommandResponse,
    CommandStatus, DeletePayload, HashPayload, ResponseMeta, SearchPayload, StatsPayload,
};
pub(crate) use views::upload_result;

use anyhow::Result;
use atomstore_ingest::{AtomstoreConfig, StoreDir};
use atomstore_protocol::{ErrorCode, COMMAND_API_VERSION};
use serde_json::Value;
use std::time::Instant;

/// Runs command API requests against one store directory
pub struct CommandHandler {
    store: StoreDir,
    config: AtomstoreConfig,
}

impl CommandHandler {
    pub fn new(store: StoreDir, config: AtomstoreConfig) -> Self {
        Self { store, config }
    }

    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        let started = Instant::now();
        let CommandRequest { action, payload } = request;

        let outcome = self.run(action, payload).await;
        let meta = ResponseMeta {
            duration_ms: Some(started.elapsed().as_millis() as u64),
            api_version: Some(COMMAND_API_VERSION),
        };

        match outcome {
            Ok(data) => CommandResponse::ok(data, meta),
            Err(err) => {
                let code = classify_error(&err);
                let message = match code {
                    ErrorCode::Internal => {
                        log::error!("{} failed: {err:#}", action.as_str());
                        "internal error".to_string()
                    }
                    _ => format!("{err:#}"),
                };
                CommandResponse::error(code, message, meta)
            }
        }
    }

    async fn run(&self, action: CommandAction, payload: Value) -> Result<Value> {
        let _lock = if action.mutates() {
            Some(self.store.lock().await?)
        } else {
            None
        };

        let pipeline = self.store.open(&self.config).await?;
        let outcome = services::route(&pipeline, action, payload).await;
        if action.mutates() {
            // Failed ingestions leave orphans; they are saved too.
            self.store.save(&pipeline).await?;
        }
        outcome
    }
}

/// Reject malformed requests with the same envelope as failed commands
pub fn invalid_request(message: impl Into<String>) -> CommandResponse {
    CommandResponse::error(
        ErrorCode::InvalidInput,
        message,
        ResponseMeta {
            api_version: Some(COMMAND_API_VERSION),
            ..Default::default()
        },
    )
}
