//! Credential Provider: source of delegation credentials for the token issuer.

use crate::{
    errors::AuthError, models::authorization::DelegationCredential,
    services::token_issuer::TOKEN_LIFETIME,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Validity requested for each delegation credential.
pub const DELEGATION_LIFETIME: Duration = Duration::hours(1);

/// Validity requested when credentials are cached. Long enough to sign many
/// full-length tokens; the service caps user delegation keys at seven days.
pub const CACHED_DELEGATION_LIFETIME: Duration = Duration::hours(6);

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtain a delegation credential scoped to the source account.
    async fn acquire(&self) -> Result<DelegationCredential, AuthError>;
}

/// Reuses a credential while it can still sign a full-length token.
///
/// A credential is handed out again only if it stays valid for
/// [`TOKEN_LIFETIME`] plus the margin. Readers share the cached value; a
/// lapsed one is replaced by whichever caller notices first. Two callers
/// racing past expiry may both fetch, which is harmless.
pub struct CachedCredentialProvider {
    inner: Arc<dyn CredentialProvider>,
    margin: Duration,
    cached: RwLock<Option<DelegationCredential>>,
}

impl CachedCredentialProvider {
    pub fn new(inner: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner,
            margin: Duration::minutes(5),
            cached: RwLock::new(None),
        }
    }

    /// Extra validity, beyond one token lifetime, a reused credential must have.
    #[must_use]
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }
}

#[async_trait]
impl CredentialProvider for CachedCredentialProvider {
    async fn acquire(&self) -> Result<DelegationCredential, AuthError> {
        let now = Utc::now();
        let required = TOKEN_LIFETIME + self.margin;
        let cached = self.cached.read().clone();
        if let Some(credential) = cached.filter(|c| c.is_usable_at(now, required)) {
            return Ok(credential);
        }

        debug!("delegation credential missing or lapsed, fetching a new one");
        let fresh = self.inner.acquire().await?;
        *self.cached.write() = Some(fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        lifetime: Duration,
    }

    #[async_trait]
    impl CredentialProvider for Counting {
        async fn acquire(&self) -> Result<DelegationCredential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(DelegationCredential {
                account_name: "acct".into(),
                signed_oid: format!("oid-{n}"),
                signed_tid: "tid".into(),
                signed_start: now - Duration::seconds(1),
                signed_expiry: now + self.lifetime,
                signed_service: "b".into(),
                signed_version: "2021-08-06".into(),
                value: "AAAA".into(),
            })
        }
    }

    #[tokio::test]
    async fn reuses_credential_inside_its_window() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime: CACHED_DELEGATION_LIFETIME,
        });
        let cached = CachedCredentialProvider::new(inner.clone());

        let first = cached.acquire().await.unwrap();
        let second = cached.acquire().await.unwrap();
        assert_eq!(first.signed_oid, second.signed_oid);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_once_the_window_lapses() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime: Duration::minutes(2),
        });
        let cached = CachedCredentialProvider::new(inner.clone());

        cached.acquire().await.unwrap();
        cached.acquire().await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn credential_shorter_than_a_token_is_not_reused() {
        // Still valid, but a token signed with it would outlive it.
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime: TOKEN_LIFETIME - Duration::minutes(10),
        });
        let cached = CachedCredentialProvider::new(inner.clone()).with_margin(Duration::zero());

        let first = cached.acquire().await.unwrap();
        let second = cached.acquire().await.unwrap();
        assert_ne!(first.signed_oid, second.signed_oid);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn default_credential_lifetime_is_never_cached() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime: DELEGATION_LIFETIME,
        });
        let cached = CachedCredentialProvider::new(inner.clone());

        cached.acquire().await.unwrap();
        cached.acquire().await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
