//! Server-side copy state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a server-side copy.
///
/// `Initiated` is the local state between issuing the copy request and
/// reading the first status back; the remaining states mirror the values the
/// storage service reports in `x-ms-copy-status`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Initiated,
    Pending,
    Success,
    Failed,
    Aborted,
}

impl CopyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CopyStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown copy status `{other}`")),
        }
    }
}

/// Copy progress as reported by the target service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyProgress {
    pub copy_id: Option<String>,
    pub status: CopyStatus,
    /// `bytes copied/total bytes`, when the service reports it.
    pub progress: Option<String>,
    pub status_description: Option<String>,
}

/// One in-flight or finished server-side copy into a target blob.
///
/// Owned by the orchestrator for the duration of a single pipeline run. The
/// authorized source URL is deliberately not kept: it embeds a bearer token.
#[derive(Clone, Debug)]
pub struct CopyOperation {
    pub target_container: String,
    pub target_blob: String,
    pub copy_id: Option<String>,
    pub status: CopyStatus,
    pub progress: Option<String>,
    pub status_description: Option<String>,
    /// Number of status polls performed after initiation.
    pub polls: u32,
}

impl CopyOperation {
    pub fn initiated(target_container: impl Into<String>, target_blob: impl Into<String>) -> Self {
        Self {
            target_container: target_container.into(),
            target_blob: target_blob.into(),
            copy_id: None,
            status: CopyStatus::Initiated,
            progress: None,
            status_description: None,
            polls: 0,
        }
    }

    /// Fold a freshly observed progress report into this operation.
    ///
    /// Reports for a different copy id (a concurrent copy into the same blob)
    /// still win: the target blob only ever reflects the last copy.
    pub fn apply(&mut self, report: CopyProgress) {
        if report.copy_id.is_some() {
            self.copy_id = report.copy_id;
        }
        self.status = report.status;
        self.progress = report.progress;
        self.status_description = report.status_description;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
