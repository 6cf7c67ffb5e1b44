//! Pipeline Driver: one run per trigger event.
//!
//! `ensure target -> enumerate source -> per object: copy, then record`.
//! The run is the single error boundary: nothing below it escapes as an
//! error, everything lands in the returned [`RunReport`].

use crate::{
    errors::{CopyError, PersistenceError},
    models::{
        event::{BlobEvent, FailureKind, ObjectFailure, RunReport, RunStage, StageFailure},
        source_object::SourceObjectDescriptor,
    },
    services::{
        gateway::ContainerHandle,
        orchestrator::CopyOrchestrator,
        recorder::CompletionRecorder,
        telemetry::{TelemetryEvent, TelemetrySink},
    },
};
use chrono::Utc;
use futures::StreamExt;
use std::{str::FromStr, sync::Arc};
use tracing::{error, info, instrument, warn};

/// What a run does after one object fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failed object.
    #[default]
    AbortOnFirstFailure,
    /// Keep going and report every failure.
    ContinueAndCollect,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" | "abort-on-first-failure" => Ok(Self::AbortOnFirstFailure),
            "continue" | "continue-and-collect" => Ok(Self::ContinueAndCollect),
            other => Err(format!(
                "unknown failure policy `{other}`, expected `abort` or `continue`"
            )),
        }
    }
}

enum ObjectError {
    Copy(CopyError),
    Persistence(PersistenceError),
}

pub struct ReplicationPipeline {
    source: ContainerHandle,
    target: ContainerHandle,
    orchestrator: CopyOrchestrator,
    recorder: Arc<dyn CompletionRecorder>,
    telemetry: Arc<dyn TelemetrySink>,
    policy: FailurePolicy,
}

impl ReplicationPipeline {
    pub fn new(
        source: ContainerHandle,
        target: ContainerHandle,
        orchestrator: CopyOrchestrator,
        recorder: Arc<dyn CompletionRecorder>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            source,
            target,
            orchestrator,
            recorder,
            telemetry,
            policy: FailurePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn source(&self) -> &ContainerHandle {
        &self.source
    }

    /// Replicate the current contents of the source container.
    #[instrument(skip_all, fields(trigger = %event.name, policy = ?self.policy))]
    pub async fn run(&self, event: &BlobEvent) -> RunReport {
        let mut report = RunReport::new(&event.name);
        info!(size = event.size(), "blob trigger received");
        self.telemetry.track(
            TelemetryEvent::info("Blob trigger function processed blob")
                .property("name", &event.name)
                .property("size", event.size()),
        );

        match self.target.ensure_created().await {
            Ok(true) => self.telemetry.track(
                TelemetryEvent::info("Created target container")
                    .property("container", self.target.name()),
            ),
            Ok(false) => {}
            Err(err) => {
                self.stage_failed(&mut report, RunStage::Provisioning, err.to_string());
                return report;
            }
        }

        let mut objects = self.source.list_flat();
        while let Some(item) = objects.next().await {
            let descriptor = match item {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    self.stage_failed(&mut report, RunStage::Enumeration, err.to_string());
                    break;
                }
            };
            report.objects_seen += 1;

            if let Err(failure) = self.replicate(&descriptor, &mut report).await {
                self.object_failed(&mut report, &descriptor, failure);
                if self.policy == FailurePolicy::AbortOnFirstFailure {
                    warn!("stopping run after first failure");
                    report.aborted = true;
                    break;
                }
            }
        }

        info!(
            seen = report.objects_seen,
            copied = report.copied.len(),
            recorded = report.recorded.len(),
            failed = report.failures.len(),
            aborted = report.aborted,
            "run finished"
        );
        report
    }

    /// Copy one object, then record it. The record is only attempted after success.
    async fn replicate(
        &self,
        descriptor: &SourceObjectDescriptor,
        report: &mut RunReport,
    ) -> Result<(), ObjectError> {
        let op = self
            .orchestrator
            .copy(&self.source, &self.target, descriptor)
            .await
            .map_err(ObjectError::Copy)?;
        report.copied.push(descriptor.name.clone());
        self.telemetry.track(
            TelemetryEvent::info(format!("Copied {}", descriptor.name))
                .property("blob", &descriptor.name)
                .property("sizeBytes", descriptor.size_bytes)
                .property("copyId", op.copy_id.as_deref().unwrap_or_default())
                .property("polls", op.polls),
        );

        self.recorder
            .record(&descriptor.name, Utc::now())
            .await
            .map_err(ObjectError::Persistence)?;
        report.recorded.push(descriptor.name.clone());
        Ok(())
    }

    fn object_failed(
        &self,
        report: &mut RunReport,
        descriptor: &SourceObjectDescriptor,
        failure: ObjectError,
    ) {
        let (kind, message) = match failure {
            ObjectError::Copy(err) => (FailureKind::Copy, err.to_string()),
            ObjectError::Persistence(err) => (FailureKind::Persistence, err.to_string()),
        };
        error!(blob = %descriptor.name, ?kind, error = %message, "object failed");
        self.telemetry.track(
            TelemetryEvent::error(format!("Error in function: {message}"))
                .property("blob", &descriptor.name)
                .property("kind", format!("{kind:?}")),
        );
        report.failures.push(ObjectFailure {
            name: descriptor.name.clone(),
            kind,
            message,
        });
    }

    fn stage_failed(&self, report: &mut RunReport, stage: RunStage, message: String) {
        error!(?stage, error = %message, "run failed");
        self.telemetry.track(
            TelemetryEvent::error(format!("Error in function: {message}"))
                .property("stage", format!("{stage:?}")),
        );
        report.stage_failure = Some(StageFailure { stage, message });
    }
}
