//! Token Issuer: mints object-scoped user delegation SAS tokens.
//!
//! Each token binds one `(container, blob)` pair, the `racwd` permission
//! set, an explicit `[now, now + 1h)` window and an https-only transport
//! requirement, and is signed with a delegation credential. A token never
//! outlives the credential that signed it: the window is cut short at the
//! credential's expiry.

use crate::{
    errors::AuthError,
    models::authorization::{
        AuthorizationToken, DelegationCredential, SasPermissions, SasProtocol, format_sas_time,
    },
    services::credentials::CredentialProvider,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;
use url::{Url, form_urlencoded};

/// Signed service version; its string-to-sign layout is what [`SignedFields`] builds.
pub const SAS_VERSION: &str = "2021-08-06";

/// Fixed token lifetime.
pub const TOKEN_LIFETIME: Duration = Duration::hours(1);

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Mint a token for exactly one blob.
    async fn issue(&self, container: &str, blob: &str) -> Result<AuthorizationToken, AuthError>;
}

/// Issues user delegation SAS tokens signed with a fresh (or cached) delegation credential.
pub struct DelegationSasIssuer {
    credentials: Arc<dyn CredentialProvider>,
    account_name: String,
}

impl DelegationSasIssuer {
    pub fn new(credentials: Arc<dyn CredentialProvider>, account_name: impl Into<String>) -> Self {
        Self {
            credentials,
            account_name: account_name.into(),
        }
    }

    /// Issue a token whose window starts at `now`.
    pub async fn issue_at(
        &self,
        container: &str,
        blob: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationToken, AuthError> {
        let credential = self.credentials.acquire().await?;
        let starts_on = now;
        let expires_on = (now + TOKEN_LIFETIME).min(credential.signed_expiry);
        if expires_on <= starts_on {
            return Err(AuthError::Delegation(format!(
                "delegation credential expired at {}",
                credential.signed_expiry
            )));
        }

        let fields = SignedFields::new(
            &self.account_name,
            container,
            blob,
            SasPermissions::REPLICATION,
            starts_on,
            expires_on,
            SasProtocol::HttpsOnly,
            &credential,
        );
        let signature = sign(&credential.value, &fields.string_to_sign())?;
        debug!(container, blob, expires_on = %expires_on, "issued blob token");

        Ok(AuthorizationToken {
            container: container.to_string(),
            blob: blob.to_string(),
            permissions: SasPermissions::REPLICATION,
            starts_on,
            expires_on,
            protocol: SasProtocol::HttpsOnly,
            query: fields.to_query(&signature),
        })
    }
}

#[async_trait]
impl TokenIssuer for DelegationSasIssuer {
    async fn issue(&self, container: &str, blob: &str) -> Result<AuthorizationToken, AuthError> {
        self.issue_at(container, blob, Utc::now()).await
    }
}

/// The signed part of a user delegation blob SAS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SignedFields {
    pub permissions: String,
    pub start: String,
    pub expiry: String,
    pub canonical_resource: String,
    pub key_oid: String,
    pub key_tid: String,
    pub key_start: String,
    pub key_expiry: String,
    pub key_service: String,
    pub key_version: String,
    pub protocol: String,
    pub version: String,
    pub resource: String,
}

impl SignedFields {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        account: &str,
        container: &str,
        blob: &str,
        permissions: SasPermissions,
        starts_on: DateTime<Utc>,
        expires_on: DateTime<Utc>,
        protocol: SasProtocol,
        key: &DelegationCredential,
    ) -> Self {
        Self {
            permissions: permissions.to_string(),
            start: format_sas_time(starts_on),
            expiry: format_sas_time(expires_on),
            canonical_resource: canonical_resource(account, container, blob),
            key_oid: key.signed_oid.clone(),
            key_tid: key.signed_tid.clone(),
            key_start: format_sas_time(key.signed_start),
            key_expiry: format_sas_time(key.signed_expiry),
            key_service: key.signed_service.clone(),
            key_version: key.signed_version.clone(),
            protocol: protocol.as_str().to_string(),
            version: SAS_VERSION.to_string(),
            resource: "b".to_string(),
        }
    }

    /// Newline-joined layout for signed versions 2020-12-06 and later.
    ///
    /// Unused optional fields (authorized/unauthorized oid, correlation id,
    /// IP range, snapshot, encryption scope, response header overrides) stay
    /// empty but keep their slots.
    pub fn string_to_sign(&self) -> String {
        [
            self.permissions.as_str(),
            &self.start,
            &self.expiry,
            &self.canonical_resource,
            &self.key_oid,
            &self.key_tid,
            &self.key_start,
            &self.key_expiry,
            &self.key_service,
            &self.key_version,
            "",
            "",
            "",
            "",
            &self.protocol,
            &self.version,
            &self.resource,
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n")
    }

    pub fn to_query(&self, signature: &str) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("sv", &self.version)
            .append_pair("spr", &self.protocol)
            .append_pair("st", &self.start)
            .append_pair("se", &self.expiry)
            .append_pair("sr", &self.resource)
            .append_pair("sp", &self.permissions)
            .append_pair("skoid", &self.key_oid)
            .append_pair("sktid", &self.key_tid)
            .append_pair("skt", &self.key_start)
            .append_pair("ske", &self.key_expiry)
            .append_pair("sks", &self.key_service)
            .append_pair("skv", &self.key_version)
            .append_pair("sig", signature)
            .finish()
    }

    /// Read the signed fields and signature back out of an authorized URL.
    ///
    /// `canonical_resource` is derived from the URL path, so a token presented
    /// against another blob yields a different string-to-sign.
    pub fn from_url(account: &str, url: &Url) -> Option<(Self, String)> {
        let lookup = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let (container, blob) = split_blob_path(url)?;
        let fields = Self {
            permissions: lookup("sp")?,
            start: lookup("st")?,
            expiry: lookup("se")?,
            canonical_resource: canonical_resource(account, &container, &blob),
            key_oid: lookup("skoid")?,
            key_tid: lookup("sktid")?,
            key_start: lookup("skt")?,
            key_expiry: lookup("ske")?,
            key_service: lookup("sks")?,
            key_version: lookup("skv")?,
            protocol: lookup("spr")?,
            version: lookup("sv")?,
            resource: lookup("sr")?,
        };
        Some((fields, lookup("sig")?))
    }
}

fn canonical_resource(account: &str, container: &str, blob: &str) -> String {
    format!("/blob/{account}/{container}/{blob}")
}

/// Decoded `(container, blob)` from a blob URL path.
pub(crate) fn split_blob_path(url: &Url) -> Option<(String, String)> {
    let path = url.path().trim_start_matches('/');
    let (container, blob) = path.split_once('/')?;
    if container.is_empty() || blob.is_empty() {
        return None;
    }
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(s)
            .decode_utf8()
            .map(|c| c.into_owned())
            .ok()
    };
    Some((decode(container)?, decode(blob)?))
}

/// HMAC-SHA256 over `string_to_sign` with a base64 key, base64-encoded.
pub(crate) fn sign(key_b64: &str, string_to_sign: &str) -> Result<String, AuthError> {
    let key = BASE64_STANDARD
        .decode(key_b64)
        .map_err(|e| AuthError::Signing(format!("delegation key is not base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| AuthError::Signing(format!("HMAC key error: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}
