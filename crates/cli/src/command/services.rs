use crate::command::domain::{
    parse_payload, AnalyzePayload, CommandAction, DeletePayload, HashPayload, SearchPayload,
    StatsPayload,
};
use crate::command::views;
use anyhow::Result;
use atomstore_ingest::{FileRecord, IngestError, IngestionPipeline};
use atomstore_store::FileId;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;

pub async fn route(
    pipeline: &IngestionPipeline,
    action: CommandAction,
    payload: Value,
) -> Result<Value> {
    match action {
        CommandAction::SearchAtoms => {
            let payload: SearchPayload = parse_payload(action, payload)?;
            let found = pipeline.search_atoms(&payload.query, payload.limit)?;
            to_value(views::search_response(found))
        }
        CommandAction::AtomDetail => {
            let payload: HashPayload = parse_payload(action, payload)?;
            to_value(views::atom_view(pipeline.atom_detail(&payload.hash)?))
        }
        CommandAction::DedupStats => {
            let payload: StatsPayload = parse_payload(action, payload)?;
            to_value(views::dedup_stats(pipeline.stats(payload.top)))
        }
        CommandAction::AnalyzeFile => {
            let payload: AnalyzePayload = parse_payload(action, payload)?;
            let record = analyze(pipeline, payload).await?;
            to_value(views::upload_result(&record))
        }
        CommandAction::FileAtoms => {
            let payload: HashPayload = parse_payload(action, payload)?;
            to_value(views::file_atoms(
                pipeline.breakdown_by_fingerprint(&payload.hash)?,
            ))
        }
        CommandAction::DeleteFile => {
            let payload: DeletePayload = parse_payload(action, payload)?;
            let file_id = FileId::new(payload.file_id.trim());
            to_value(views::delete_result(pipeline.delete_file(&file_id)?))
        }
        CommandAction::Gc => {
            let report = pipeline.collect_garbage().await?;
            to_value(views::gc_result(&report))
        }
        CommandAction::Verify => to_value(views::verify_result(pipeline.verify().await)),
    }
}

async fn analyze(pipeline: &IngestionPipeline, payload: AnalyzePayload) -> Result<FileRecord> {
    match payload {
        AnalyzePayload {
            path: Some(path),
            content_base64: None,
            ..
        } => Ok(pipeline.ingest_path(path).await?),
        AnalyzePayload {
            path: None,
            filename: Some(filename),
            content_base64: Some(encoded),
        } => {
            let data = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|err| IngestError::invalid_input(format!("content_base64: {err}")))?;
            Ok(pipeline.ingest_bytes(filename, data).await?)
        }
        _ => Err(IngestError::invalid_input(
            "analyze_file takes either `path` or `filename` with `content_base64`",
        )
        .into()),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(Into::into)
}
