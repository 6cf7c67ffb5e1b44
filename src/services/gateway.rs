//! Container Gateway: per-container and per-blob operations over a pluggable
//! storage backend.
//!
//! Backends implement the small [`ContainerClient`] trait (one request per
//! method). [`ContainerHandle`] and [`BlobHandle`] build the pipeline-facing
//! semantics on top: idempotent provisioning, lazy paged enumeration, copy
//! initiation and polling.

use crate::{
    errors::AuthError,
    models::{
        copy::{CopyOperation, CopyProgress},
        source_object::{BlobPage, BlobProperties, SourceObjectDescriptor},
    },
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("container `{0}` already exists")]
    ContainerAlreadyExists(String),
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("blob `{blob}` not found in container `{container}`")]
    BlobNotFound { container: String, blob: String },
    #[error("storage service returned HTTP {status} ({code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("malformed storage response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Storage primitives for one container.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical, unauthorized address of a blob in this container.
    fn blob_url(&self, blob: &str) -> Url;

    async fn exists(&self) -> GatewayResult<bool>;

    /// Create the container. Fails with `ContainerAlreadyExists` if it is present.
    async fn create(&self) -> GatewayResult<()>;

    /// Fetch one page of a flat listing, starting after `marker`.
    async fn list_page(&self, marker: Option<String>) -> GatewayResult<BlobPage>;

    /// Start a server-side copy from `source` into `blob`.
    async fn start_copy(&self, blob: &str, source: &Url) -> GatewayResult<CopyProgress>;

    /// `None` when the blob does not exist.
    async fn blob_properties(&self, blob: &str) -> GatewayResult<Option<BlobProperties>>;
}

/// Build a blob URL below a container URL, keeping `/` in blob names as path separators.
pub fn join_blob_url(base: &Url, container: &str, blob: &str) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(container).extend(blob.split('/'));
    }
    url
}

/// Pipeline-facing view of one container.
#[derive(Clone)]
pub struct ContainerHandle {
    client: Arc<dyn ContainerClient>,
}

impl ContainerHandle {
    pub fn new(client: Arc<dyn ContainerClient>) -> Self {
        Self { client }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub async fn exists(&self) -> GatewayResult<bool> {
        self.client.exists().await
    }

    /// Create the container if absent. Returns `true` if this call created it.
    ///
    /// Losing a create race to another run counts as "already there".
    pub async fn ensure_created(&self) -> GatewayResult<bool> {
        if self.client.exists().await? {
            debug!(container = self.name(), "container already exists");
            return Ok(false);
        }
        match self.client.create().await {
            Ok(()) => {
                info!(container = self.name(), "created container");
                Ok(true)
            }
            Err(GatewayError::ContainerAlreadyExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Lazily enumerate every blob, one page request at a time.
    ///
    /// Each call starts a fresh enumeration; a stream cannot be restarted.
    pub fn list_flat(&self) -> BoxStream<'static, GatewayResult<SourceObjectDescriptor>> {
        enum Cursor {
            Start,
            Next(String),
            Done,
        }

        let client = Arc::clone(&self.client);
        futures::stream::try_unfold(Cursor::Start, move |cursor| {
            let client = Arc::clone(&client);
            async move {
                let marker = match cursor {
                    Cursor::Done => return Ok::<_, GatewayError>(None),
                    Cursor::Start => None,
                    Cursor::Next(marker) => Some(marker),
                };
                let page = client.list_page(marker).await?;
                let next = match page.next_marker {
                    Some(marker) if !marker.is_empty() => Cursor::Next(marker),
                    _ => Cursor::Done,
                };
                let items = futures::stream::iter(
                    page.items.into_iter().map(Ok::<_, GatewayError>),
                );
                Ok(Some((items, next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    /// Handle for a blob. Existence is not checked.
    pub fn blob(&self, name: &str) -> BlobHandle {
        BlobHandle {
            client: Arc::clone(&self.client),
            name: name.to_string(),
        }
    }
}

/// Pipeline-facing view of one blob.
#[derive(Clone)]
pub struct BlobHandle {
    client: Arc<dyn ContainerClient>,
    name: String,
}

impl BlobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &str {
        self.client.name()
    }

    pub fn url(&self) -> Url {
        self.client.blob_url(&self.name)
    }

    pub async fn properties(&self) -> GatewayResult<Option<BlobProperties>> {
        self.client.blob_properties(&self.name).await
    }

    /// Start a server-side copy into this blob from an already-authorized source URL.
    pub async fn begin_copy_from(&self, authorized_source: &Url) -> GatewayResult<CopyOperation> {
        let progress = self.client.start_copy(&self.name, authorized_source).await?;
        let mut op = CopyOperation::initiated(self.container(), &self.name);
        op.apply(progress);
        debug!(
            container = self.container(),
            blob = %self.name,
            status = %op.status,
            "copy initiated"
        );
        Ok(op)
    }

    /// Refresh `op` with the copy state currently reported for this blob.
    pub async fn poll(&self, op: &mut CopyOperation) -> GatewayResult<()> {
        let props = self
            .client
            .blob_properties(&self.name)
            .await?
            .ok_or_else(|| GatewayError::BlobNotFound {
                container: self.container().to_string(),
                blob: self.name.clone(),
            })?;
        let progress = props.copy.ok_or_else(|| {
            GatewayError::Malformed(format!("blob `{}` reports no copy status", self.name))
        })?;
        op.apply(progress);
        op.polls += 1;
        Ok(())
    }
}
