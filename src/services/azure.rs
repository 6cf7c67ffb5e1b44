//! Azure Blob Storage backend over the Blob REST API.
//!
//! XML bodies go through `quick_xml`'s serde support.
//!
//! Every request carries a bearer token from the injected
//! [`IdentityResolver`]; no account keys are used. The service client doubles
//! as the [`CredentialProvider`] for the source account, since user
//! delegation keys are requested from the same endpoint.

use crate::{
    errors::AuthError,
    models::{
        authorization::{DelegationCredential, format_sas_time},
        copy::{CopyProgress, CopyStatus},
        source_object::{BlobPage, BlobProperties, SourceObjectDescriptor},
    },
    services::{
        credentials::{CredentialProvider, DELEGATION_LIFETIME},
        gateway::{ContainerClient, ContainerHandle, GatewayError, GatewayResult, join_blob_url},
        identity::{IdentityResolver, STORAGE_SCOPE},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

/// REST API version sent as `x-ms-version`.
const AZURE_API_VERSION: &str = "2021-08-06";

struct Shared {
    http: reqwest::Client,
    base_url: Url,
    account_name: String,
    identity: Arc<dyn IdentityResolver>,
}

impl Shared {
    /// Start a request with version, date and bearer headers applied.
    async fn request(&self, method: Method, url: Url) -> GatewayResult<RequestBuilder> {
        let token = self.identity.access_token(STORAGE_SCOPE).await?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token.token)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-date", rfc1123_now()))
    }
}

/// Client for one storage account's blob endpoint.
#[derive(Clone)]
pub struct AzureBlobService {
    shared: Arc<Shared>,
    key_lifetime: Duration,
}

impl AzureBlobService {
    pub fn new(
        http: reqwest::Client,
        account_uri: &str,
        account_name: impl Into<String>,
        identity: Arc<dyn IdentityResolver>,
    ) -> GatewayResult<Self> {
        let base_url = Url::parse(account_uri)?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Malformed(format!(
                "account uri `{account_uri}` cannot carry a path"
            )));
        }
        let account_name = account_name.into();
        info!(account = %account_name, endpoint = %base_url, "azure blob service configured");
        Ok(Self {
            shared: Arc::new(Shared {
                http,
                base_url,
                account_name,
                identity,
            }),
            key_lifetime: DELEGATION_LIFETIME,
        })
    }

    /// Validity requested for user delegation keys.
    #[must_use]
    pub fn with_key_lifetime(mut self, lifetime: Duration) -> Self {
        self.key_lifetime = lifetime;
        self
    }

    pub fn account_name(&self) -> &str {
        &self.shared.account_name
    }

    /// Open a container on this account. No request is made.
    pub fn container(&self, name: &str) -> ContainerHandle {
        ContainerHandle::new(Arc::new(AzureContainerClient {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        }))
    }

    /// Request a user delegation key valid over `[start, expiry)`.
    #[instrument(skip(self), fields(account = %self.shared.account_name))]
    pub async fn user_delegation_key(
        &self,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<DelegationCredential, AuthError> {
        let mut url = self.shared.base_url.clone();
        url.set_query(Some("restype=service&comp=userdelegationkey"));
        let body = key_info_body(start, expiry)?;

        let request = self
            .shared
            .request(Method::POST, url)
            .await
            .map_err(|e| match e {
                GatewayError::Auth(auth) => auth,
                other => AuthError::Delegation(other.to_string()),
            })?;
        let resp = request
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| AuthError::Delegation(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AuthError::Delegation(format!("reading response failed: {e}")))?;
        if status != StatusCode::OK {
            return Err(AuthError::Delegation(format!("HTTP {status}: {text}")));
        }
        parse_delegation_key(&self.shared.account_name, &text)
    }
}

#[async_trait]
impl CredentialProvider for AzureBlobService {
    async fn acquire(&self) -> Result<DelegationCredential, AuthError> {
        let now = Utc::now();
        self.user_delegation_key(now, now + self.key_lifetime).await
    }
}

struct AzureContainerClient {
    shared: Arc<Shared>,
    name: String,
}

impl AzureContainerClient {
    fn container_url(&self, extra_query: &[(&str, &str)]) -> Url {
        let mut url = self.shared.base_url.clone();
        url.set_query(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.name);
        }
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("restype", "container");
            for (k, v) in extra_query {
                pairs.append_pair(k, v);
            }
        }
        url
    }
}

#[async_trait]
impl ContainerClient for AzureContainerClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn blob_url(&self, blob: &str) -> Url {
        join_blob_url(&self.shared.base_url, &self.name, blob)
    }

    async fn exists(&self) -> GatewayResult<bool> {
        let resp = self
            .shared
            .request(Method::HEAD, self.container_url(&[]))
            .await?
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(service_error(resp).await),
        }
    }

    async fn create(&self) -> GatewayResult<()> {
        let resp = self
            .shared
            .request(Method::PUT, self.container_url(&[]))
            .await?
            .header("Content-Length", "0")
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => Err(GatewayError::ContainerAlreadyExists(self.name.clone())),
            _ => Err(service_error(resp).await),
        }
    }

    #[instrument(skip(self), fields(container = %self.name))]
    async fn list_page(&self, marker: Option<String>) -> GatewayResult<BlobPage> {
        let mut query = vec![("comp", "list")];
        if let Some(marker) = marker.as_deref() {
            query.push(("marker", marker));
        }
        let resp = self
            .shared
            .request(Method::GET, self.container_url(&query))
            .await?
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let body = resp.text().await?;
                let page = parse_list_blobs(&body)?;
                debug!(items = page.items.len(), more = page.next_marker.is_some(), "listed page");
                Ok(page)
            }
            StatusCode::NOT_FOUND => Err(GatewayError::ContainerNotFound(self.name.clone())),
            _ => Err(service_error(resp).await),
        }
    }

    async fn start_copy(&self, blob: &str, source: &Url) -> GatewayResult<CopyProgress> {
        let resp = self
            .shared
            .request(Method::PUT, self.blob_url(blob))
            .await?
            .header("x-ms-copy-source", source.as_str())
            .header("Content-Length", "0")
            .send()
            .await?;
        match resp.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED => {
                copy_progress_from_headers(resp.headers())?.ok_or_else(|| {
                    GatewayError::Malformed("copy response without x-ms-copy-status".into())
                })
            }
            StatusCode::NOT_FOUND => Err(GatewayError::ContainerNotFound(self.name.clone())),
            _ => Err(service_error(resp).await),
        }
    }

    async fn blob_properties(&self, blob: &str) -> GatewayResult<Option<BlobProperties>> {
        let resp = self
            .shared
            .request(Method::HEAD, self.blob_url(blob))
            .await?
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => properties_from_headers(blob, resp.headers()).map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(service_error(resp).await),
        }
    }
}

/// Current time in the RFC 1123 layout used by `x-ms-date`.
fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

async fn service_error(resp: Response) -> GatewayError {
    let status = resp.status().as_u16();
    let code = header_str(resp.headers(), "x-ms-error-code")
        .unwrap_or("Unknown")
        .to_string();
    let message = resp.text().await.unwrap_or_default();
    GatewayError::Service {
        status,
        code,
        message,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn copy_progress_from_headers(headers: &HeaderMap) -> GatewayResult<Option<CopyProgress>> {
    let Some(raw) = header_str(headers, "x-ms-copy-status") else {
        return Ok(None);
    };
    let status = raw.parse::<CopyStatus>().map_err(GatewayError::Malformed)?;
    Ok(Some(CopyProgress {
        copy_id: header_str(headers, "x-ms-copy-id").map(str::to_string),
        status,
        progress: header_str(headers, "x-ms-copy-progress").map(str::to_string),
        status_description: header_str(headers, "x-ms-copy-status-description")
            .map(str::to_string),
    }))
}

fn properties_from_headers(blob: &str, headers: &HeaderMap) -> GatewayResult<BlobProperties> {
    let size_bytes = header_str(headers, "content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let last_modified = header_str(headers, "last-modified")
        .map(parse_http_date)
        .transpose()?
        .unwrap_or_else(Utc::now);
    Ok(BlobProperties {
        name: blob.to_string(),
        size_bytes,
        last_modified,
        etag: header_str(headers, "etag").map(|e| e.trim_matches('"').to_string()),
        copy: copy_progress_from_headers(headers)?,
    })
}

fn parse_http_date(value: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GatewayError::Malformed(format!("bad date `{value}`: {e}")))
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Serialize)]
#[serde(rename = "KeyInfo", rename_all = "PascalCase")]
struct KeyInfo {
    start: String,
    expiry: String,
}

fn key_info_body(start: DateTime<Utc>, expiry: DateTime<Utc>) -> Result<String, AuthError> {
    let info = KeyInfo {
        start: format_sas_time(start),
        expiry: format_sas_time(expiry),
    };
    let xml = quick_xml::se::to_string(&info)
        .map_err(|e| AuthError::Delegation(format!("encoding KeyInfo failed: {e}")))?;
    Ok(format!(r#"<?xml version="1.0" encoding="utf-8"?>{xml}"#))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    #[serde(default)]
    properties: BlobItemProperties,
}

#[derive(Default, Deserialize)]
struct BlobItemProperties {
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserDelegationKey {
    signed_oid: String,
    signed_tid: String,
    signed_start: String,
    signed_expiry: String,
    signed_service: String,
    signed_version: String,
    value: String,
}

/// Storage responses may start with a byte order mark.
fn strip_bom(body: &str) -> &str {
    body.trim_start_matches('\u{feff}')
}

/// Parse a `List Blobs` response body.
fn parse_list_blobs(body: &str) -> GatewayResult<BlobPage> {
    let results: EnumerationResults = quick_xml::de::from_str(strip_bom(body))
        .map_err(|e| GatewayError::Malformed(format!("list blobs response: {e}")))?;

    let items = results
        .blobs
        .items
        .into_iter()
        .map(|blob| -> GatewayResult<SourceObjectDescriptor> {
            let last_modified = blob
                .properties
                .last_modified
                .as_deref()
                .map(parse_http_date)
                .transpose()?
                .unwrap_or_else(Utc::now);
            let size_bytes = blob.properties.content_length.unwrap_or(0);
            Ok(SourceObjectDescriptor::new(blob.name, size_bytes, last_modified))
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    let next_marker = results.next_marker.filter(|m| !m.is_empty());
    Ok(BlobPage { items, next_marker })
}

fn parse_delegation_key(account: &str, body: &str) -> Result<DelegationCredential, AuthError> {
    let key: UserDelegationKey = quick_xml::de::from_str(strip_bom(body))
        .map_err(|e| AuthError::Delegation(format!("delegation key response: {e}")))?;
    let time = |tag: &str, raw: &str| {
        parse_rfc3339(raw)
            .ok_or_else(|| AuthError::Delegation(format!("unreadable <{tag}> `{raw}`")))
    };
    Ok(DelegationCredential {
        account_name: account.to_string(),
        signed_start: time("SignedStart", &key.signed_start)?,
        signed_expiry: time("SignedExpiry", &key.signed_expiry)?,
        signed_oid: key.signed_oid,
        signed_tid: key.signed_tid,
        signed_service: key.signed_service,
        signed_version: key.signed_version,
        value: key.value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::StaticTokenResolver;
    use axum::{
        Router,
        extract::Path,
        http::Method as ServerMethod,
        response::{IntoResponse, Response as ServerResponse},
        routing::any,
    };
    use reqwest::header::HeaderValue;

    const LIST_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="test">
  <Blobs>
    <Blob>
      <Name>a.txt</Name>
      <Properties>
        <Last-Modified>Mon, 05 Jan 2026 10:00:00 GMT</Last-Modified>
        <Content-Length>5</Content-Length>
      </Properties>
    </Blob>
    <Blob>
      <Name>R&amp;D/b.txt</Name>
      <Properties>
        <Last-Modified>Mon, 05 Jan 2026 10:01:00 GMT</Last-Modified>
        <Content-Length>10</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDA</NextMarker>
</EnumerationResults>"#;

    #[test]
    fn parses_list_blobs_page() {
        let page = parse_list_blobs(LIST_XML).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].name, "a.txt");
        assert_eq!(page.items[0].size_bytes, 5);
        assert_eq!(page.items[1].name, "R&D/b.txt");
        assert_eq!(page.items[1].size_bytes, 10);
        assert_eq!(page.next_marker.as_deref(), Some("2!72!MDAwMDA"));
    }

    #[test]
    fn empty_next_marker_ends_listing() {
        let page = parse_list_blobs("<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>")
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn parses_user_delegation_key() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<UserDelegationKey>
  <SignedOid>oid-1</SignedOid>
  <SignedTid>tid-1</SignedTid>
  <SignedStart>2026-01-05T10:00:00Z</SignedStart>
  <SignedExpiry>2026-01-05T11:00:00Z</SignedExpiry>
  <SignedService>b</SignedService>
  <SignedVersion>2021-08-06</SignedVersion>
  <Value>a2V5LW1hdGVyaWFs</Value>
</UserDelegationKey>"#;
        let key = parse_delegation_key("acct", body).unwrap();
        assert_eq!(key.signed_oid, "oid-1");
        assert_eq!(format_sas_time(key.signed_expiry), "2026-01-05T11:00:00Z");
        assert_eq!(key.value, "a2V5LW1hdGVyaWFs");
    }

    #[test]
    fn incomplete_delegation_key_is_an_auth_failure() {
        let err = parse_delegation_key("acct", "<UserDelegationKey/>").unwrap_err();
        assert!(matches!(err, AuthError::Delegation(_)));
    }

    #[test]
    fn reads_copy_state_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-copy-id", HeaderValue::from_static("c-42"));
        headers.insert("x-ms-copy-status", HeaderValue::from_static("pending"));
        headers.insert("x-ms-copy-progress", HeaderValue::from_static("0/10"));
        headers.insert("content-length", HeaderValue::from_static("0"));
        headers.insert(
            "last-modified",
            HeaderValue::from_static("Mon, 05 Jan 2026 10:00:00 GMT"),
        );
        let props = properties_from_headers("a.txt", &headers).unwrap();
        let copy = props.copy.unwrap();
        assert_eq!(copy.copy_id.as_deref(), Some("c-42"));
        assert_eq!(copy.status, CopyStatus::Pending);
        assert_eq!(copy.progress.as_deref(), Some("0/10"));
    }

    #[test]
    fn container_and_blob_urls() {
        let service = AzureBlobService::new(
            reqwest::Client::new(),
            "https://acct.blob.core.windows.net",
            "acct",
            Arc::new(StaticTokenResolver::new("t")),
        )
        .unwrap();
        let client = AzureContainerClient {
            shared: Arc::clone(&service.shared),
            name: "test".into(),
        };
        assert_eq!(
            client.container_url(&[("comp", "list")]).as_str(),
            "https://acct.blob.core.windows.net/test?restype=container&comp=list"
        );
        assert_eq!(
            client.blob_url("a.txt").as_str(),
            "https://acct.blob.core.windows.net/test/a.txt"
        );
    }

    #[test]
    fn key_info_body_is_well_formed() {
        let start = parse_rfc3339("2026-01-05T10:00:00Z").unwrap();
        let body = key_info_body(start, start + Duration::hours(1)).unwrap();
        assert!(body.starts_with("<?xml"));
        assert!(body.ends_with(
            "<KeyInfo><Start>2026-01-05T10:00:00Z</Start><Expiry>2026-01-05T11:00:00Z</Expiry></KeyInfo>"
        ));
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let body = format!("\u{feff}{LIST_XML}");
        assert_eq!(parse_list_blobs(&body).unwrap().items.len(), 2);
    }

    // Containers: `raced` is absent on HEAD/GET but conflicts on PUT,
    // `listed` serves one page, anything else fails with a 500.
    async fn container_route(method: ServerMethod, Path(container): Path<String>) -> ServerResponse {
        match (container.as_str(), method) {
            ("raced", ServerMethod::HEAD) => StatusCode::NOT_FOUND.into_response(),
            ("raced", ServerMethod::PUT) => (
                StatusCode::CONFLICT,
                [("x-ms-error-code", "ContainerAlreadyExists")],
            )
                .into_response(),
            ("raced", ServerMethod::GET) => (
                StatusCode::NOT_FOUND,
                [("x-ms-error-code", "ContainerNotFound")],
            )
                .into_response(),
            ("listed", ServerMethod::GET) => (StatusCode::OK, LIST_XML).into_response(),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("x-ms-error-code", "InternalError")],
                "boom",
            )
                .into_response(),
        }
    }

    async fn blob_route(method: ServerMethod, Path((_, blob)): Path<(String, String)>) -> ServerResponse {
        match (blob.as_str(), method) {
            ("ghost.txt", ServerMethod::HEAD) => StatusCode::NOT_FOUND.into_response(),
            (_, ServerMethod::PUT) => (
                StatusCode::ACCEPTED,
                [("x-ms-copy-id", "c-7"), ("x-ms-copy-status", "pending")],
            )
                .into_response(),
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn serve() -> AzureBlobService {
        let app = Router::new()
            .route("/{container}", any(container_route))
            .route("/{container}/{*blob}", any(blob_route));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        AzureBlobService::new(
            reqwest::Client::new(),
            &format!("http://{addr}/"),
            "acct",
            Arc::new(StaticTokenResolver::new("t")),
        )
        .unwrap()
    }

    fn client(service: &AzureBlobService, name: &str) -> AzureContainerClient {
        AzureContainerClient {
            shared: Arc::clone(&service.shared),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn head_not_found_means_absent_container() {
        let service = serve().await;
        assert!(!client(&service, "raced").exists().await.unwrap());
    }

    #[tokio::test]
    async fn create_conflict_maps_to_already_exists() {
        let service = serve().await;
        let err = client(&service, "raced").create().await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerAlreadyExists(name) if name == "raced"));

        // Lost create race: absent on HEAD, conflict on PUT.
        assert!(!service.container("raced").ensure_created().await.unwrap());
    }

    #[tokio::test]
    async fn listing_a_missing_container_is_not_found() {
        let service = serve().await;
        let err = client(&service, "raced").list_page(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn listing_reads_the_served_page() {
        let service = serve().await;
        let page = client(&service, "listed").list_page(None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_marker.as_deref(), Some("2!72!MDAwMDA"));
    }

    #[tokio::test]
    async fn missing_blob_has_no_properties() {
        let service = serve().await;
        let props = client(&service, "raced").blob_properties("ghost.txt").await.unwrap();
        assert!(props.is_none());
    }

    #[tokio::test]
    async fn accepted_copy_reads_copy_headers() {
        let service = serve().await;
        let source = Url::parse("https://src.blob.core.windows.net/test/a.txt?sig=x").unwrap();
        let progress = client(&service, "target")
            .start_copy("a.txt", &source)
            .await
            .unwrap();
        assert_eq!(progress.copy_id.as_deref(), Some("c-7"));
        assert_eq!(progress.status, CopyStatus::Pending);
    }

    #[tokio::test]
    async fn unexpected_status_keeps_service_error_code() {
        let service = serve().await;
        let err = client(&service, "broken").exists().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Service { status: 500, ref code, .. } if code == "InternalError"
        ));
    }
}
