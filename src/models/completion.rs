//! Durable marker that one blob finished copying.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row in `FilesCopied`.
///
/// Column names follow the table schema, hence the PascalCase renames.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Name of the copied blob.
    #[sqlx(rename = "FileName")]
    pub file_name: String,

    /// When the copy was recorded as complete.
    #[sqlx(rename = "CreatedDate")]
    pub created_date: DateTime<Utc>,
}
