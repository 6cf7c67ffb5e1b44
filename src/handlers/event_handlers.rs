//! The trigger endpoint and the read-only view of completion records.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{completion::CompletionRecord, event::BlobEvent, event::RunReport},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use bytes::Bytes;

/// `POST /events/{*name}`
///
/// The body is the new blob's content, the path its name. The event is always
/// accepted: the outcome of the run, failures included, is in the report.
pub async fn handle_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<RunReport>) {
    let event = BlobEvent::new(name, body);
    let report = state.pipeline.run(&event).await;
    (StatusCode::OK, Json(report))
}

/// `GET /records`
pub async fn list_records(
    State(state): State<AppState>,
) -> Result<Json<Vec<CompletionRecord>>, AppError> {
    Ok(Json(state.records.list().await?))
}
