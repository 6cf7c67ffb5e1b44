//! Trigger input and the outcome of one pipeline run.

use bytes::Bytes;
use serde::Serialize;

/// A new-blob notification.
///
/// The payload is only used for logging its size; enumeration of the source
/// container drives what actually gets copied.
#[derive(Clone, Debug)]
pub struct BlobEvent {
    pub name: String,
    pub payload: Bytes,
}

impl BlobEvent {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Which step of the per-object sequence failed.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Copy,
    Persistence,
}

/// Run-level steps that can fail before any object is processed.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Provisioning,
    Enumeration,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectFailure {
    pub name: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: RunStage,
    pub message: String,
}

/// Everything a caller learns about a run. There is no other failure channel.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub trigger: String,
    /// Objects pulled from the enumeration, including ones that failed.
    pub objects_seen: usize,
    /// Objects whose copy reached `success`.
    pub copied: Vec<String>,
    /// Objects with a completion record written (or enqueued).
    pub recorded: Vec<String>,
    pub failures: Vec<ObjectFailure>,
    pub stage_failure: Option<StageFailure>,
    /// Set when the failure policy ended the run at a failed object.
    pub aborted: bool,
}

impl RunReport {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.stage_failure.is_none()
    }

    pub fn failure_for(&self, name: &str) -> Option<&ObjectFailure> {
        self.failures.iter().find(|f| f.name == name)
    }
}
