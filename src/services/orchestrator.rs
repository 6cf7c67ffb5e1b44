//! Copy Orchestrator: authorize, start and await one server-side copy.

use crate::{
    errors::CopyError,
    models::{
        copy::{CopyOperation, CopyStatus},
        source_object::SourceObjectDescriptor,
    },
    services::{
        gateway::{ContainerHandle, GatewayError},
        token_issuer::TokenIssuer,
    },
};
use chrono::{Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// How copies are awaited.
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    /// Pause between status polls.
    pub interval: Duration,
    /// Stop waiting this long before the source token expires.
    pub token_margin: ChronoDuration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            token_margin: ChronoDuration::minutes(1),
        }
    }
}

pub struct CopyOrchestrator {
    issuer: Arc<dyn TokenIssuer>,
    poll: PollSettings,
}

impl CopyOrchestrator {
    pub fn new(issuer: Arc<dyn TokenIssuer>, poll: PollSettings) -> Self {
        Self { issuer, poll }
    }

    /// Copy one source blob into the target container under the same name.
    ///
    /// Returns the operation once it reached `success`. Not idempotent against
    /// a still-pending earlier copy of the same name: the service restarts it.
    #[instrument(skip_all, fields(blob = %descriptor.name))]
    pub async fn copy(
        &self,
        source: &ContainerHandle,
        target: &ContainerHandle,
        descriptor: &SourceObjectDescriptor,
    ) -> Result<CopyOperation, CopyError> {
        let name = descriptor.name.as_str();
        let source_blob = source.blob(name);
        let target_blob = target.blob(name);

        let token = self
            .issuer
            .issue(source.name(), name)
            .await
            .map_err(|err| CopyError::Authorization {
                blob: name.to_string(),
                source: err,
            })?;
        let authorized = token.authorize(&source_blob.url());
        let gateway_err = |err: GatewayError| CopyError::Gateway {
            blob: name.to_string(),
            source: err,
        };

        let mut op = target_blob
            .begin_copy_from(&authorized)
            .await
            .map_err(gateway_err)?;

        let deadline = token.expires_on - self.poll.token_margin;
        while !op.is_terminal() {
            if Utc::now() >= deadline {
                warn!(polls = op.polls, "copy outlived its source authorization window");
                return Err(CopyError::AuthorizationWindowElapsed {
                    blob: name.to_string(),
                    expires_on: token.expires_on,
                });
            }
            tokio::time::sleep(self.poll.interval).await;
            target_blob.poll(&mut op).await.map_err(gateway_err)?;
            debug!(status = %op.status, progress = ?op.progress, "copy status");
        }

        match op.status {
            CopyStatus::Success => Ok(op),
            status => Err(CopyError::Terminal {
                blob: name.to_string(),
                status,
                description: op
                    .status_description
                    .clone()
                    .unwrap_or_else(|| "no description".into()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::AuthError,
        models::authorization::AuthorizationToken,
        services::{memory::MemoryAccount, token_issuer::DelegationSasIssuer},
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    fn fast() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            token_margin: ChronoDuration::minutes(1),
        }
    }

    async fn setup(account: &MemoryAccount) -> (ContainerHandle, ContainerHandle) {
        account.put_blob("test", "a.txt", Bytes::from_static(b"hello"));
        let target = account.container("target");
        target.ensure_created().await.unwrap();
        (account.container("test"), target)
    }

    fn descriptor(name: &str, size: u64) -> SourceObjectDescriptor {
        SourceObjectDescriptor::new(name, size, Utc::now())
    }

    #[tokio::test]
    async fn copies_under_the_same_name_after_polling() {
        let account = MemoryAccount::new("acct").unwrap().with_pending_polls(3);
        let (source, target) = setup(&account).await;
        let orchestrator = CopyOrchestrator::new(
            Arc::new(DelegationSasIssuer::new(Arc::new(account.clone()), "acct")),
            fast(),
        );

        let op = orchestrator
            .copy(&source, &target, &descriptor("a.txt", 5))
            .await
            .unwrap();
        assert_eq!(op.status, CopyStatus::Success);
        assert_eq!(op.target_blob, "a.txt");
        assert_eq!(op.polls, 4);
        let props = target.blob("a.txt").properties().await.unwrap().unwrap();
        assert_eq!(props.size_bytes, 5);
    }

    #[tokio::test]
    async fn failed_and_aborted_copies_are_copy_failures() {
        for outcome in [CopyStatus::Failed, CopyStatus::Aborted] {
            let account = MemoryAccount::new("acct").unwrap().with_pending_polls(1);
            account.force_copy_outcome("a.txt", outcome);
            let (source, target) = setup(&account).await;
            let orchestrator = CopyOrchestrator::new(
                Arc::new(DelegationSasIssuer::new(Arc::new(account.clone()), "acct")),
                fast(),
            );

            let err = orchestrator
                .copy(&source, &target, &descriptor("a.txt", 5))
                .await
                .unwrap_err();
            assert!(matches!(err, CopyError::Terminal { status, .. } if status == outcome));
        }
    }

    struct RefusingIssuer;

    #[async_trait]
    impl TokenIssuer for RefusingIssuer {
        async fn issue(&self, _: &str, _: &str) -> Result<AuthorizationToken, AuthError> {
            Err(AuthError::Identity("no identity".into()))
        }
    }

    #[tokio::test]
    async fn token_failure_starts_no_copy() {
        let account = MemoryAccount::new("acct").unwrap();
        let (source, target) = setup(&account).await;
        let orchestrator = CopyOrchestrator::new(Arc::new(RefusingIssuer), fast());

        let err = orchestrator
            .copy(&source, &target, &descriptor("a.txt", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Authorization { .. }));
        assert!(account.copies_started().is_empty());
        assert!(account.blob_data("target", "a.txt").is_none());
    }

    #[tokio::test]
    async fn stops_waiting_when_the_token_window_is_used_up() {
        let account = MemoryAccount::new("acct").unwrap().with_pending_polls(u32::MAX);
        let (source, target) = setup(&account).await;
        let orchestrator = CopyOrchestrator::new(
            Arc::new(DelegationSasIssuer::new(Arc::new(account.clone()), "acct")),
            PollSettings {
                interval: Duration::from_millis(1),
                token_margin: ChronoDuration::minutes(61),
            },
        );

        let err = orchestrator
            .copy(&source, &target, &descriptor("a.txt", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::AuthorizationWindowElapsed { .. }));
    }
}
