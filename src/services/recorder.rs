//! Completion Recorder: durable `FilesCopied` rows for finished copies.

use crate::{
    errors::PersistenceError,
    models::completion::CompletionRecord,
    services::telemetry::{TelemetryEvent, TelemetrySink},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{str::FromStr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, instrument};

/// Width of the `FileName` column.
pub const MAX_FILE_NAME_LEN: usize = 255;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait CompletionRecorder: Send + Sync {
    /// Persist that `file_name` finished copying at `at`.
    async fn record(&self, file_name: &str, at: DateTime<Utc>) -> Result<(), PersistenceError>;
}

fn check_file_name(file_name: &str) -> Result<(), PersistenceError> {
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(PersistenceError::FileNameTooLong {
            name: file_name.to_string(),
            len: file_name.len(),
            max: MAX_FILE_NAME_LEN,
        });
    }
    Ok(())
}

/// Duplicate handling for repeated records of the same file name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordMode {
    /// Every call inserts a row.
    #[default]
    Append,
    /// A name already present is left alone.
    InsertIfAbsent,
}

impl FromStr for RecordMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "insert-if-absent" => Ok(Self::InsertIfAbsent),
            other => Err(format!(
                "unknown record mode `{other}`, expected `append` or `insert-if-absent`"
            )),
        }
    }
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn migrate(db: &SqlitePool) -> Result<(), PersistenceError> {
    let statements = MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());
    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/// Writes records straight into SQLite.
#[derive(Clone)]
pub struct SqlCompletionRecorder {
    db: Arc<SqlitePool>,
    mode: RecordMode,
}

impl SqlCompletionRecorder {
    pub fn new(db: Arc<SqlitePool>, mode: RecordMode) -> Self {
        Self { db, mode }
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    /// Every record, oldest first.
    pub async fn list(&self) -> Result<Vec<CompletionRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, CompletionRecord>(
            "SELECT FileName, CreatedDate FROM FilesCopied ORDER BY Id",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CompletionRecorder for SqlCompletionRecorder {
    #[instrument(skip(self, at), fields(mode = ?self.mode))]
    async fn record(&self, file_name: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        check_file_name(file_name)?;

        let result = match self.mode {
            RecordMode::Append => {
                sqlx::query("INSERT INTO FilesCopied (FileName, CreatedDate) VALUES (?, ?)")
                    .bind(file_name)
                    .bind(at)
                    .execute(&*self.db)
                    .await?
            }
            RecordMode::InsertIfAbsent => {
                sqlx::query(
                    r#"
                    INSERT INTO FilesCopied (FileName, CreatedDate)
                    SELECT ?, ?
                    WHERE NOT EXISTS (SELECT 1 FROM FilesCopied WHERE FileName = ?)
                    "#,
                )
                .bind(file_name)
                .bind(at)
                .bind(file_name)
                .execute(&*self.db)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            debug!("completion record already present");
        } else {
            debug!("completion record written");
        }
        Ok(())
    }
}

/// Hands records to a background writer.
///
/// `record` returns once the record is queued. Failures of the eventual
/// write are logged and sent to telemetry; the caller never sees them.
pub struct QueuedCompletionRecorder {
    tx: mpsc::Sender<(String, DateTime<Utc>)>,
}

impl QueuedCompletionRecorder {
    /// Start the writer. It stops once every clone of the recorder is dropped
    /// and the queue is drained; await the returned handle to flush.
    pub fn spawn(
        inner: Arc<dyn CompletionRecorder>,
        capacity: usize,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<(String, DateTime<Utc>)>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some((file_name, at)) = rx.recv().await {
                if let Err(err) = inner.record(&file_name, at).await {
                    error!(file_name = %file_name, error = %err, "queued completion record failed");
                    telemetry.track(
                        TelemetryEvent::error("Failed to persist completion record")
                            .property("fileName", &file_name)
                            .property("error", &err),
                    );
                }
            }
            debug!("completion queue drained");
        });
        (Self { tx }, worker)
    }
}

#[async_trait]
impl CompletionRecorder for QueuedCompletionRecorder {
    async fn record(&self, file_name: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        check_file_name(file_name)?;
        self.tx
            .send((file_name.to_string(), at))
            .await
            .map_err(|_| PersistenceError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::telemetry::CollectingSink;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> Arc<SqlitePool> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&db).await.unwrap();
        Arc::new(db)
    }

    fn names(records: &[CompletionRecord]) -> Vec<&str> {
        records.iter().map(|r| r.file_name.as_str()).collect()
    }

    #[tokio::test]
    async fn append_mode_keeps_duplicates() {
        let recorder = SqlCompletionRecorder::new(pool().await, RecordMode::Append);
        recorder.record("a.txt", Utc::now()).await.unwrap();
        recorder.record("a.txt", Utc::now()).await.unwrap();
        recorder.record("b.txt", Utc::now()).await.unwrap();

        let rows = recorder.list().await.unwrap();
        assert_eq!(names(&rows), vec!["a.txt", "a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn insert_if_absent_writes_each_name_once() {
        let recorder = SqlCompletionRecorder::new(pool().await, RecordMode::InsertIfAbsent);
        recorder.record("a.txt", Utc::now()).await.unwrap();
        recorder.record("a.txt", Utc::now()).await.unwrap();

        assert_eq!(names(&recorder.list().await.unwrap()), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn created_date_round_trips() {
        let recorder = SqlCompletionRecorder::new(pool().await, RecordMode::Append);
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        recorder.record("a.txt", at).await.unwrap();

        let rows = recorder.list().await.unwrap();
        assert_eq!(rows[0].created_date, at);
    }

    #[tokio::test]
    async fn overlong_names_are_rejected_before_insert() {
        let recorder = SqlCompletionRecorder::new(pool().await, RecordMode::Append);
        let name = "x".repeat(MAX_FILE_NAME_LEN + 1);

        let err = recorder.record(&name, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::FileNameTooLong { len: 256, .. }));
        assert!(recorder.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn migrate_is_repeatable() {
        let db = pool().await;
        migrate(&db).await.unwrap();
    }

    #[tokio::test]
    async fn queued_records_are_flushed_by_the_worker() {
        let sql = SqlCompletionRecorder::new(pool().await, RecordMode::Append);
        let sink = Arc::new(CollectingSink::default());
        let (queued, worker) = QueuedCompletionRecorder::spawn(Arc::new(sql.clone()), 4, sink.clone());

        queued.record("a.txt", Utc::now()).await.unwrap();
        queued.record("b.txt", Utc::now()).await.unwrap();
        drop(queued);
        worker.await.unwrap();

        assert_eq!(names(&sql.list().await.unwrap()), vec!["a.txt", "b.txt"]);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn queued_write_failures_go_to_telemetry() {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        // No schema: every insert fails.
        let sql = SqlCompletionRecorder::new(Arc::new(db), RecordMode::Append);
        let sink = Arc::new(CollectingSink::default());
        let (queued, worker) = QueuedCompletionRecorder::spawn(Arc::new(sql), 4, sink.clone());

        queued.record("a.txt", Utc::now()).await.unwrap();
        drop(queued);
        worker.await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].properties["fileName"], "a.txt");
    }

    #[test]
    fn record_mode_parses_config_values() {
        assert_eq!("append".parse::<RecordMode>().unwrap(), RecordMode::Append);
        assert_eq!(
            "Insert-If-Absent".parse::<RecordMode>().unwrap(),
            RecordMode::InsertIfAbsent
        );
        assert!("upsert".parse::<RecordMode>().is_err());
    }
}
