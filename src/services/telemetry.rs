//! Telemetry Sink: fire-and-forget structured traces.
//!
//! Sinks never block the caller and never report failure back to it. The
//! Application Insights sink hands events to a background task which posts
//! them; anything that goes wrong there ends up in a `warn!` and nowhere else.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Public ingestion endpoint for Application Insights.
pub const APP_INSIGHTS_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Events waiting for delivery. Further events are dropped while it is full.
pub const APP_INSIGHTS_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

impl Severity {
    /// Application Insights `severityLevel` value.
    fn level(self) -> u8 {
        match self {
            Severity::Information => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
        }
    }
}

/// One trace: a message plus free-form properties.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    pub message: String,
    pub severity: Severity,
    pub properties: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Information)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Warning)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Error)
    }

    fn with_severity(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            properties: BTreeMap::new(),
            time: Utc::now(),
        }
    }

    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn track(&self, event: TelemetryEvent);
}

/// Re-emits telemetry as `tracing` records.
pub struct TracingSink {
    application_name: String,
}

impl TracingSink {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }
}

impl TelemetrySink for TracingSink {
    fn track(&self, event: TelemetryEvent) {
        let app = self.application_name.as_str();
        let props = &event.properties;
        match event.severity {
            Severity::Information => info!(application_name = app, ?props, "{}", event.message),
            Severity::Warning => warn!(application_name = app, ?props, "{}", event.message),
            Severity::Error => error!(application_name = app, ?props, "{}", event.message),
        }
    }
}

/// Posts traces to Application Insights from a background task.
///
/// The queue is bounded; when delivery falls behind, new events are dropped
/// with a warning instead of piling up.
pub struct AppInsightsSink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl AppInsightsSink {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(
        http: reqwest::Client,
        endpoint: Url,
        instrumentation_key: String,
        application_name: String,
    ) -> Self {
        Self::spawn_with_capacity(
            http,
            endpoint,
            instrumentation_key,
            application_name,
            APP_INSIGHTS_QUEUE_CAPACITY,
        )
    }

    pub fn spawn_with_capacity(
        http: reqwest::Client,
        endpoint: Url,
        instrumentation_key: String,
        application_name: String,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let body = envelope(&instrumentation_key, &application_name, &event);
                match http.post(endpoint.clone()).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("telemetry delivered");
                    }
                    Ok(resp) => warn!(status = %resp.status(), "telemetry rejected"),
                    Err(err) => warn!(error = %err, "telemetry delivery failed"),
                }
            }
            debug!("telemetry worker stopped");
        });
        Self { tx }
    }
}

impl TelemetrySink for AppInsightsSink {
    fn track(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(message = %event.message, "telemetry queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("telemetry worker is gone, event dropped");
            }
        }
    }
}

/// Build an Application Insights `MessageData` envelope.
fn envelope(instrumentation_key: &str, application_name: &str, event: &TelemetryEvent) -> Value {
    let mut properties = event.properties.clone();
    properties.insert("applicationName".into(), application_name.to_string());
    json!({
        "name": format!(
            "Microsoft.ApplicationInsights.{}.Message",
            instrumentation_key.replace('-', "")
        ),
        "time": event.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        "iKey": instrumentation_key,
        "tags": { "ai.cloud.role": application_name },
        "data": {
            "baseType": "MessageData",
            "baseData": {
                "ver": 2,
                "message": event.message,
                "severityLevel": event.severity.level(),
                "properties": properties,
            }
        }
    })
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl TelemetrySink for CollectingSink {
    fn track(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
