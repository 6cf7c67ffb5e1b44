use crate::{models::copy::CopyStatus, services::gateway::GatewayError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Identity or token issuance could not complete.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity resolution failed: {0}")]
    Identity(String),
    #[error("delegation credential request failed: {0}")]
    Delegation(String),
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// A single object's copy did not reach `success`.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("authorizing copy source `{blob}` failed: {source}")]
    Authorization {
        blob: String,
        #[source]
        source: AuthError,
    },
    #[error("copy of `{blob}` ended with status {status}: {description}")]
    Terminal {
        blob: String,
        status: CopyStatus,
        description: String,
    },
    #[error("copy of `{blob}` still pending when its source token expires at {expires_on}")]
    AuthorizationWindowElapsed {
        blob: String,
        expires_on: DateTime<Utc>,
    },
    #[error("copy of `{blob}` failed at the storage service: {source}")]
    Gateway {
        blob: String,
        #[source]
        source: GatewayError,
    },
}

/// The completion record could not be persisted.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("file name `{name}` is {len} bytes, longer than the {max} allowed")]
    FileNameTooLong { name: String, len: usize, max: usize },
    #[error("completion queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Required configuration is missing or malformed. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration `{key}`")]
    Missing { key: &'static str },
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
