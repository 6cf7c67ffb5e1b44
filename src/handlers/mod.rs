//! HTTP handlers and the state they share.

use crate::services::{pipeline::ReplicationPipeline, recorder::SqlCompletionRecorder};
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod event_handlers;
pub mod health_handlers;

/// Built once in `main` and cloned into every request.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ReplicationPipeline>,
    pub records: SqlCompletionRecorder,
    pub db: Arc<SqlitePool>,
}
