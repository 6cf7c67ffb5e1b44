//! In-memory storage account. Suitable for development and testing.
//!
//! Behaves like the real service where the pipeline can observe it:
//! copy sources must carry a valid delegation SAS (signature, blob scope,
//! validity window, https) signed by an unexpired key, copies stay `pending` for a configurable number
//! of status polls, and copy outcomes can be forced per blob name.

use crate::{
    errors::AuthError,
    models::{
        authorization::{DelegationCredential, SAS_TIME_FORMAT, SasPermissions},
        copy::{CopyProgress, CopyStatus},
        source_object::{BlobPage, BlobProperties, SourceObjectDescriptor},
    },
    services::{
        credentials::{CredentialProvider, DELEGATION_LIFETIME},
        gateway::{ContainerClient, ContainerHandle, GatewayError, GatewayResult, join_blob_url},
        token_issuer::{SAS_VERSION, SignedFields, sign, split_blob_path},
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;
use url::Url;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 5000;
const ACCOUNT_NAME_MIN_LEN: usize = 3;
const ACCOUNT_NAME_MAX_LEN: usize = 24;

struct PendingCopy {
    id: String,
    remaining_polls: u32,
    data: Bytes,
    outcome: CopyStatus,
}

struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
    copy: Option<CopyProgress>,
    pending: Option<PendingCopy>,
}

impl StoredBlob {
    fn new(data: Bytes) -> Self {
        let etag = format!("{:x}", md5::compute(&data));
        Self {
            data,
            last_modified: Utc::now(),
            etag,
            copy: None,
            pending: None,
        }
    }

    /// Count one status poll against a pending copy and settle it when due.
    fn advance_copy(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return;
        }
        if let Some(done) = self.pending.take() {
            self.settle(done);
        }
    }

    fn settle(&mut self, copy: PendingCopy) {
        let total = copy.data.len();
        let (data, progress, description) = match copy.outcome {
            CopyStatus::Success => (copy.data, format!("{total}/{total}"), None),
            other => (
                Bytes::new(),
                format!("0/{total}"),
                Some(format!("copy forced to {other}")),
            ),
        };
        *self = Self {
            copy: Some(CopyProgress {
                copy_id: Some(copy.id),
                status: copy.outcome,
                progress: Some(progress),
                status_description: description,
            }),
            ..Self::new(data)
        };
    }
}

struct State {
    containers: BTreeMap<String, BTreeMap<String, StoredBlob>>,
    keys: Vec<DelegationCredential>,
    forced_outcomes: HashMap<String, CopyStatus>,
    copies_started: Vec<String>,
    page_size: usize,
    pending_polls: u32,
}

struct Inner {
    account_name: String,
    base_url: Url,
    state: RwLock<State>,
}

/// A single storage account held in memory.
#[derive(Clone)]
pub struct MemoryAccount {
    inner: Arc<Inner>,
}

impl MemoryAccount {
    /// Create an empty account reachable at `https://{account_name}.blob.core.windows.net/`.
    ///
    /// Account names follow the service rules: 3–24 lowercase letters or digits.
    pub fn new(account_name: &str) -> GatewayResult<Self> {
        let len = account_name.len();
        if !(ACCOUNT_NAME_MIN_LEN..=ACCOUNT_NAME_MAX_LEN).contains(&len)
            || !account_name
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9'))
        {
            return Err(GatewayError::Malformed(format!(
                "invalid storage account name `{account_name}`"
            )));
        }
        let base_url = Url::parse(&format!("https://{account_name}.blob.core.windows.net/"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                account_name: account_name.to_string(),
                base_url,
                state: RwLock::new(State {
                    containers: BTreeMap::new(),
                    keys: Vec::new(),
                    forced_outcomes: HashMap::new(),
                    copies_started: Vec::new(),
                    page_size: DEFAULT_PAGE_SIZE,
                    pending_polls: 0,
                }),
            }),
        })
    }

    /// Number of blobs returned per listing page.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.inner.state.write().page_size = page_size.max(1);
        self
    }

    /// Number of status polls a copy stays `pending` before it settles.
    #[must_use]
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.inner.state.write().pending_polls = polls;
        self
    }

    pub fn account_name(&self) -> &str {
        &self.inner.account_name
    }

    pub fn container(&self, name: &str) -> ContainerHandle {
        ContainerHandle::new(Arc::new(MemoryContainerClient {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }))
    }

    /// Store a blob directly, creating the container if needed.
    pub fn put_blob(&self, container: &str, name: &str, data: Bytes) {
        self.inner
            .state
            .write()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), StoredBlob::new(data));
    }

    /// Content of a blob whose copy (if any) has settled.
    pub fn blob_data(&self, container: &str, name: &str) -> Option<Bytes> {
        let state = self.inner.state.read();
        let blob = state.containers.get(container)?.get(name)?;
        blob.pending.is_none().then(|| blob.data.clone())
    }

    pub fn blob_names(&self, container: &str) -> Vec<String> {
        let state = self.inner.state.read();
        state
            .containers
            .get(container)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every future copy into a blob with this name end in `outcome`.
    pub fn force_copy_outcome(&self, name: &str, outcome: CopyStatus) {
        self.inner
            .state
            .write()
            .forced_outcomes
            .insert(name.to_string(), outcome);
    }

    /// Target blob names, in the order copies were accepted.
    pub fn copies_started(&self) -> Vec<String> {
        self.inner.state.read().copies_started.clone()
    }

    /// Check a copy source URL the way the service would before fetching it.
    pub fn authorize_source(&self, source: &Url) -> GatewayResult<(String, String)> {
        self.inner.authorize_source(source, Utc::now())
    }
}

impl Inner {
    fn authorize_source(&self, source: &Url, now: DateTime<Utc>) -> GatewayResult<(String, String)> {
        let denied = |message: &str| GatewayError::Service {
            status: 403,
            code: "CannotVerifyCopySource".into(),
            message: message.to_string(),
        };

        if source.host_str() != self.base_url.host_str() {
            return Err(denied("copy source is not on this account"));
        }
        let (fields, signature) = SignedFields::from_url(&self.account_name, source)
            .ok_or_else(|| denied("copy source carries no usable SAS"))?;
        let (container, blob) =
            split_blob_path(source).ok_or_else(|| denied("copy source is not a blob URL"))?;

        if fields.protocol == "https" && source.scheme() != "https" {
            return Err(denied("SAS requires https"));
        }
        if fields.resource != "b" || fields.version != SAS_VERSION {
            return Err(denied("unsupported SAS resource or version"));
        }
        let perms = SasPermissions::parse(&fields.permissions)
            .ok_or_else(|| denied("malformed SAS permissions"))?;
        if !perms.read {
            return Err(denied("SAS does not grant read"));
        }

        let start = parse_sas_time(&fields.start).ok_or_else(|| denied("malformed st"))?;
        let expiry = parse_sas_time(&fields.expiry).ok_or_else(|| denied("malformed se"))?;
        if now < start {
            return Err(denied("SAS is not yet valid"));
        }
        if now >= expiry {
            return Err(denied("SAS has expired"));
        }

        let state = self.state.read();
        let key = state
            .keys
            .iter()
            .find(|k| k.signed_oid == fields.key_oid && k.signed_tid == fields.key_tid)
            .ok_or_else(|| denied("SAS was signed by an unknown key"))?;
        if now >= key.signed_expiry {
            return Err(denied("SAS signing key has expired"));
        }
        let expected = sign(&key.value, &fields.string_to_sign())
            .map_err(|_| denied("SAS signature could not be computed"))?;
        if expected != signature {
            return Err(denied("SAS signature mismatch"));
        }
        Ok((container, blob))
    }
}

fn parse_sas_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, SAS_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl CredentialProvider for MemoryAccount {
    async fn acquire(&self) -> Result<DelegationCredential, AuthError> {
        let now = Utc::now();
        let mut material = Uuid::new_v4().as_bytes().to_vec();
        material.extend_from_slice(Uuid::new_v4().as_bytes());
        let credential = DelegationCredential {
            account_name: self.inner.account_name.clone(),
            signed_oid: Uuid::new_v4().to_string(),
            signed_tid: "memory-tenant".into(),
            // Token timestamps are second-granular; keep the key window aligned.
            signed_start: parse_sas_time(&now.format(SAS_TIME_FORMAT).to_string()).unwrap_or(now),
            signed_expiry: now + DELEGATION_LIFETIME,
            signed_service: "b".into(),
            signed_version: SAS_VERSION.into(),
            value: BASE64_STANDARD.encode(material),
        };
        let mut state = self.inner.state.write();
        state.keys.retain(|key| key.signed_expiry > now);
        state.keys.push(credential.clone());
        Ok(credential)
    }
}

struct MemoryContainerClient {
    inner: Arc<Inner>,
    name: String,
}

#[async_trait]
impl ContainerClient for MemoryContainerClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn blob_url(&self, blob: &str) -> Url {
        join_blob_url(&self.inner.base_url, &self.name, blob)
    }

    async fn exists(&self) -> GatewayResult<bool> {
        Ok(self.inner.state.read().containers.contains_key(&self.name))
    }

    async fn create(&self) -> GatewayResult<()> {
        let mut state = self.inner.state.write();
        if state.containers.contains_key(&self.name) {
            return Err(GatewayError::ContainerAlreadyExists(self.name.clone()));
        }
        state.containers.insert(self.name.clone(), BTreeMap::new());
        Ok(())
    }

    async fn list_page(&self, marker: Option<String>) -> GatewayResult<BlobPage> {
        let state = self.inner.state.read();
        let blobs = state
            .containers
            .get(&self.name)
            .ok_or_else(|| GatewayError::ContainerNotFound(self.name.clone()))?;

        let mut remaining = blobs
            .iter()
            .filter(|(name, _)| marker.as_deref().is_none_or(|m| name.as_str() > m));
        let items: Vec<SourceObjectDescriptor> = remaining
            .by_ref()
            .take(state.page_size)
            .map(|(name, blob)| {
                SourceObjectDescriptor::new(name.clone(), blob.data.len() as u64, blob.last_modified)
            })
            .collect();
        let next_marker = match (remaining.next(), items.last()) {
            (Some(_), Some(last)) => Some(last.name.clone()),
            _ => None,
        };
        Ok(BlobPage { items, next_marker })
    }

    async fn start_copy(&self, blob: &str, source: &Url) -> GatewayResult<CopyProgress> {
        let (src_container, src_blob) = self.inner.authorize_source(source, Utc::now())?;

        let mut state = self.inner.state.write();
        if !state.containers.contains_key(&self.name) {
            return Err(GatewayError::ContainerNotFound(self.name.clone()));
        }
        let data = state
            .containers
            .get(&src_container)
            .and_then(|blobs| blobs.get(&src_blob))
            .map(|b| b.data.clone())
            .ok_or_else(|| GatewayError::Service {
                status: 404,
                code: "CannotVerifyCopySource".into(),
                message: format!("source blob `{src_container}/{src_blob}` does not exist"),
            })?;

        let pending_polls = state.pending_polls;
        let outcome = state
            .forced_outcomes
            .get(blob)
            .copied()
            .unwrap_or(CopyStatus::Success);
        let pending = PendingCopy {
            id: Uuid::new_v4().to_string(),
            remaining_polls: pending_polls,
            data,
            outcome,
        };
        let copy_id = pending.id.clone();
        let total = pending.data.len();

        let mut target = StoredBlob::new(Bytes::new());
        let report = if pending_polls == 0 {
            target.settle(pending);
            target.copy.clone().ok_or_else(|| {
                GatewayError::Malformed("settled copy has no progress".into())
            })?
        } else {
            let report = CopyProgress {
                copy_id: Some(copy_id),
                status: CopyStatus::Pending,
                progress: Some(format!("0/{total}")),
                status_description: None,
            };
            target.copy = Some(report.clone());
            target.pending = Some(pending);
            report
        };

        state.copies_started.push(blob.to_string());
        if let Some(blobs) = state.containers.get_mut(&self.name) {
            blobs.insert(blob.to_string(), target);
        }
        debug!(container = %self.name, blob, status = %report.status, "memory copy accepted");
        Ok(report)
    }

    async fn blob_properties(&self, blob: &str) -> GatewayResult<Option<BlobProperties>> {
        let mut state = self.inner.state.write();
        let Some(stored) = state
            .containers
            .get_mut(&self.name)
            .and_then(|blobs| blobs.get_mut(blob))
        else {
            return Ok(None);
        };
        stored.advance_copy();
        Ok(Some(BlobProperties {
            name: blob.to_string(),
            size_bytes: stored.data.len() as u64,
            last_modified: stored.last_modified,
            etag: Some(stored.etag.clone()),
            copy: stored.copy.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::authorization::SasProtocol,
        services::token_issuer::{DelegationSasIssuer, TOKEN_LIFETIME},
    };
    use chrono::Duration;

    fn seeded() -> MemoryAccount {
        let account = MemoryAccount::new("acct").unwrap();
        account.put_blob("test", "a.txt", Bytes::from_static(b"hello"));
        account.put_blob("test", "b.txt", Bytes::from_static(b"0123456789"));
        account
    }

    #[tokio::test]
    async fn token_is_accepted_for_its_own_blob() {
        let account = seeded();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer.issue_at("test", "a.txt", Utc::now()).await.unwrap();
        let url = token.authorize(&account.container("test").blob("a.txt").url());

        let (container, blob) = account.authorize_source(&url).unwrap();
        assert_eq!((container.as_str(), blob.as_str()), ("test", "a.txt"));
    }

    #[tokio::test]
    async fn token_is_rejected_for_any_other_blob() {
        let account = seeded();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer.issue_at("test", "a.txt", Utc::now()).await.unwrap();
        let url = token.authorize(&account.container("test").blob("b.txt").url());

        let err = account.authorize_source(&url).unwrap_err();
        assert!(matches!(err, GatewayError::Service { status: 403, .. }));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let account = seeded();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer
            .issue_at("test", "a.txt", Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        let url = token.authorize(&account.container("test").blob("a.txt").url());

        let err = account.authorize_source(&url).unwrap_err();
        assert!(matches!(err, GatewayError::Service { status: 403, ref message, .. } if message.contains("expired")));
    }

    #[tokio::test]
    async fn plain_http_is_rejected_for_https_only_tokens() {
        let account = seeded();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer.issue_at("test", "a.txt", Utc::now()).await.unwrap();
        let mut url = token.authorize(&account.container("test").blob("a.txt").url());
        url.set_scheme("http").unwrap();

        assert!(account.authorize_source(&url).is_err());
    }

    #[tokio::test]
    async fn unsigned_copy_source_is_rejected() {
        let account = seeded();
        account.container("target").ensure_created().await.unwrap();
        let target = account.container("target").blob("a.txt");
        let bare = account.container("test").blob("a.txt").url();

        assert!(target.begin_copy_from(&bare).await.is_err());
        assert!(account.copies_started().is_empty());
    }

    #[tokio::test]
    async fn pending_copy_settles_after_configured_polls() {
        let account = seeded().with_pending_polls(2);
        account.container("target").ensure_created().await.unwrap();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer.issue_at("test", "a.txt", Utc::now()).await.unwrap();
        let source = token.authorize(&account.container("test").blob("a.txt").url());

        let target = account.container("target").blob("a.txt");
        let mut op = target.begin_copy_from(&source).await.unwrap();
        assert_eq!(op.status, CopyStatus::Pending);

        target.poll(&mut op).await.unwrap();
        target.poll(&mut op).await.unwrap();
        assert_eq!(op.status, CopyStatus::Pending);
        target.poll(&mut op).await.unwrap();
        assert_eq!(op.status, CopyStatus::Success);
        assert_eq!(
            account.blob_data("target", "a.txt"),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn forced_failure_leaves_an_empty_failed_blob() {
        let account = seeded();
        account.force_copy_outcome("a.txt", CopyStatus::Failed);
        account.container("target").ensure_created().await.unwrap();
        let issuer = DelegationSasIssuer::new(Arc::new(account.clone()), "acct");
        let token = issuer.issue_at("test", "a.txt", Utc::now()).await.unwrap();
        let source = token.authorize(&account.container("test").blob("a.txt").url());

        let op = account
            .container("target")
            .blob("a.txt")
            .begin_copy_from(&source)
            .await
            .unwrap();
        assert_eq!(op.status, CopyStatus::Failed);
        assert_eq!(account.blob_data("target", "a.txt"), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn token_outliving_its_key_is_rejected_once_the_key_expires() {
        let account = seeded();
        let key = account.acquire().await.unwrap();
        // Signed by hand: the issuer never lets a token outlive its key.
        let fields = SignedFields::new(
            "acct",
            "test",
            "a.txt",
            SasPermissions::REPLICATION,
            key.signed_start,
            key.signed_expiry + TOKEN_LIFETIME,
            SasProtocol::HttpsOnly,
            &key,
        );
        let signature = sign(&key.value, &fields.string_to_sign()).unwrap();
        let mut url = account.container("test").blob("a.txt").url();
        url.set_query(Some(&fields.to_query(&signature)));

        let inside = key.signed_expiry - Duration::minutes(1);
        assert!(account.inner.authorize_source(&url, inside).is_ok());

        let after = key.signed_expiry + Duration::minutes(1);
        let err = account.inner.authorize_source(&url, after).unwrap_err();
        assert!(matches!(err, GatewayError::Service { status: 403, ref message, .. } if message.contains("key has expired")));
    }

    #[tokio::test]
    async fn acquiring_a_key_prunes_expired_ones() {
        let account = seeded();
        let mut stale = account.acquire().await.unwrap();
        stale.signed_oid = "stale".into();
        stale.signed_expiry = Utc::now() - Duration::minutes(1);
        account.inner.state.write().keys.push(stale);
        assert_eq!(account.inner.state.read().keys.len(), 2);

        account.acquire().await.unwrap();
        let keys = account.inner.state.read();
        assert_eq!(keys.keys.len(), 2);
        assert!(keys.keys.iter().all(|k| k.signed_oid != "stale"));
    }
}
