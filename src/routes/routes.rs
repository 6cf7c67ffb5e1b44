//! Defines the HTTP surface of the replicator.
//!
//! - `POST /events/{*name}`: new-blob trigger; body is the blob, path its name
//! - `GET  /records`: completion records written so far
//! - `GET  /healthz`, `GET /readyz`: health checks
//!
//! The wildcard `*name` allows nested blob names like `photos/2025/img.jpg`.

use crate::handlers::{
    AppState,
    event_handlers::{handle_event, list_records},
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events/{*name}", post(handle_event))
        .route("/records", get(list_records))
}
