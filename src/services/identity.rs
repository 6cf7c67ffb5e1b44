//! Identity resolution for storage access.
//!
//! The pipeline never reaches for ambient credentials on its own: an
//! [`IdentityResolver`] is built once at startup and shared read-only.
//! Production resolvers wrap `azure_identity` credentials, which own token
//! acquisition and caching.

use crate::errors::AuthError;
use async_trait::async_trait;
use azure_core::credentials::{Secret, TokenCredential};
use azure_identity::{
    AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
    ManagedIdentityCredentialOptions, UserAssignedId,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// OAuth scope for blob data-plane calls.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Bearer token plus its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token for `scope`.
    async fn access_token(&self, scope: &str) -> Result<AccessToken, AuthError>;
}

/// Fixed bearer token, for development against emulators.
pub struct StaticTokenResolver {
    token: String,
}

impl StaticTokenResolver {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticTokenResolver {
    async fn access_token(&self, _scope: &str) -> Result<AccessToken, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::Identity("static token is empty".into()));
        }
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on: Utc::now() + Duration::hours(1),
        })
    }
}

/// Adapts an `azure_identity` credential to [`IdentityResolver`].
pub struct AzureCredentialResolver {
    credential: Arc<dyn TokenCredential>,
}

impl AzureCredentialResolver {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl IdentityResolver for AzureCredentialResolver {
    async fn access_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let token = self
            .credential
            .get_token(&[scope], None)
            .await
            .map_err(|e| AuthError::Identity(e.to_string()))?;
        let expires_on = DateTime::from_timestamp(token.expires_on.unix_timestamp(), 0)
            .ok_or_else(|| AuthError::Identity("token expiry out of range".into()))?;
        Ok(AccessToken {
            token: token.token.secret().to_string(),
            expires_on,
        })
    }
}

/// One link of the ambient credential chain.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET`.
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// Identity of the hosting environment; user-assigned when a client id is given.
    ManagedIdentity { client_id: Option<String> },
    /// Login context of the Azure CLI.
    AzureCli,
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
            Self::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            Self::AzureCli => f.write_str("AzureCli"),
        }
    }
}

impl CredentialSource {
    /// Order in which credentials are tried: service principal (when fully
    /// configured), managed identity, then the Azure CLI.
    pub fn chain(
        tenant_id: Option<&str>,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Vec<Self> {
        let mut chain = Vec::with_capacity(3);
        if let (Some(tenant_id), Some(client_id), Some(client_secret)) =
            (tenant_id, client_id, client_secret)
        {
            chain.push(Self::ServicePrincipal {
                tenant_id: tenant_id.to_string(),
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            });
        }
        // A client id next to a secret belongs to the service principal.
        let user_assigned = client_id.filter(|_| client_secret.is_none());
        chain.push(Self::ManagedIdentity {
            client_id: user_assigned.map(str::to_string),
        });
        chain.push(Self::AzureCli);
        chain
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ServicePrincipal { .. } => "service-principal",
            Self::ManagedIdentity { .. } => "managed-identity",
            Self::AzureCli => "azure-cli",
        }
    }

    /// Build the `azure_identity` credential for this link.
    pub fn build(&self) -> Result<Arc<dyn TokenCredential>, AuthError> {
        let credential: Arc<dyn TokenCredential> = match self {
            Self::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => {
                debug!(tenant_id = %tenant_id, "building ClientSecretCredential");
                ClientSecretCredential::new(
                    tenant_id,
                    client_id.clone(),
                    Secret::new(client_secret.clone()),
                    None,
                )
                .map_err(|e| AuthError::Identity(e.to_string()))?
            }
            Self::ManagedIdentity { client_id } => {
                let options = ManagedIdentityCredentialOptions {
                    user_assigned_id: client_id.clone().map(UserAssignedId::ClientId),
                    ..Default::default()
                };
                ManagedIdentityCredential::new(Some(options))
                    .map_err(|e| AuthError::Identity(e.to_string()))?
            }
            Self::AzureCli => {
                AzureCliCredential::new(None).map_err(|e| AuthError::Identity(e.to_string()))?
            }
        };
        Ok(credential)
    }
}

/// Tries each resolver in order; the first one that answers is kept for
/// later calls.
pub struct ChainedIdentityResolver {
    links: Vec<(&'static str, Arc<dyn IdentityResolver>)>,
    selected: Mutex<Option<usize>>,
}

impl ChainedIdentityResolver {
    pub fn new(links: Vec<(&'static str, Arc<dyn IdentityResolver>)>) -> Self {
        Self {
            links,
            selected: Mutex::new(None),
        }
    }

    /// The ambient default chain built from [`CredentialSource::chain`].
    ///
    /// A link whose credential cannot be constructed is skipped.
    pub fn from_sources(sources: &[CredentialSource]) -> Result<Self, AuthError> {
        let mut links: Vec<(&'static str, Arc<dyn IdentityResolver>)> = Vec::new();
        for source in sources {
            match source.build() {
                Ok(credential) => {
                    links.push((source.label(), Arc::new(AzureCredentialResolver::new(credential))));
                }
                Err(err) => warn!(credential = source.label(), error = %err, "credential unavailable"),
            }
        }
        if links.is_empty() {
            return Err(AuthError::Identity("no usable credential in chain".into()));
        }
        info!(
            chain = ?links.iter().map(|(label, _)| *label).collect::<Vec<_>>(),
            "identity chain configured"
        );
        Ok(Self::new(links))
    }
}

#[async_trait]
impl IdentityResolver for ChainedIdentityResolver {
    async fn access_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let selected = *self.selected.lock();
        if let Some((label, resolver)) = selected.and_then(|i| self.links.get(i)) {
            debug!(credential = label, scope, "using selected credential");
            return resolver.access_token(scope).await;
        }

        let mut failures = Vec::with_capacity(self.links.len());
        for (index, (label, resolver)) in self.links.iter().enumerate() {
            match resolver.access_token(scope).await {
                Ok(token) => {
                    info!(credential = label, "identity resolved");
                    *self.selected.lock() = Some(index);
                    return Ok(token);
                }
                Err(err) => {
                    debug!(credential = label, error = %err, "credential failed");
                    failures.push(format!("{label}: {err}"));
                }
            }
        }
        Err(AuthError::Identity(format!(
            "every credential failed ({})",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inner: StaticTokenResolver,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(token: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: StaticTokenResolver::new(token),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IdentityResolver for Counting {
        async fn access_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.access_token(scope).await
        }
    }

    #[tokio::test]
    async fn static_resolver_returns_its_token() {
        let resolver = StaticTokenResolver::new("dev-token");
        let token = resolver.access_token(STORAGE_SCOPE).await.unwrap();
        assert_eq!(token.token, "dev-token");
        assert!(token.expires_on > Utc::now());
        assert!(!format!("{token:?}").contains("dev-token"));
    }

    #[tokio::test]
    async fn empty_static_token_is_an_auth_failure() {
        let resolver = StaticTokenResolver::new("");
        assert!(matches!(
            resolver.access_token(STORAGE_SCOPE).await,
            Err(AuthError::Identity(_))
        ));
    }

    #[test]
    fn full_service_principal_leads_the_chain() {
        let chain = CredentialSource::chain(Some("tid"), Some("cid"), Some("s3cr3t-value"));
        let labels: Vec<_> = chain.iter().map(CredentialSource::label).collect();
        assert_eq!(labels, vec!["service-principal", "managed-identity", "azure-cli"]);
        assert_eq!(chain[1], CredentialSource::ManagedIdentity { client_id: None });
        assert!(!format!("{:?}", chain[0]).contains("s3cr3t-value"));
    }

    #[test]
    fn lone_client_id_selects_a_user_assigned_identity() {
        let chain = CredentialSource::chain(None, Some("cid"), None);
        assert_eq!(
            chain,
            vec![
                CredentialSource::ManagedIdentity {
                    client_id: Some("cid".into())
                },
                CredentialSource::AzureCli,
            ]
        );
    }

    #[test]
    fn partial_service_principal_is_not_used() {
        let chain = CredentialSource::chain(Some("tid"), None, Some("secret"));
        let labels: Vec<_> = chain.iter().map(CredentialSource::label).collect();
        assert_eq!(labels, vec!["managed-identity", "azure-cli"]);
    }

    #[tokio::test]
    async fn chain_falls_through_to_the_first_working_credential() {
        let broken = Counting::new("");
        let working = Counting::new("cli-token");
        let chain = ChainedIdentityResolver::new(vec![
            ("managed-identity", broken.clone() as Arc<dyn IdentityResolver>),
            ("azure-cli", working.clone() as Arc<dyn IdentityResolver>),
        ]);

        let token = chain.access_token(STORAGE_SCOPE).await.unwrap();
        assert_eq!(token.token, "cli-token");
        chain.access_token(STORAGE_SCOPE).await.unwrap();

        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(working.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chain_reports_every_failure() {
        let chain = ChainedIdentityResolver::new(vec![
            ("managed-identity", Counting::new("") as Arc<dyn IdentityResolver>),
            ("azure-cli", Counting::new("") as Arc<dyn IdentityResolver>),
        ]);
        let err = chain.access_token(STORAGE_SCOPE).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("managed-identity"), "{message}");
        assert!(message.contains("azure-cli"), "{message}");
    }
}
