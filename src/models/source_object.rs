//! Represents one blob observed in the source container during enumeration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a source blob taken at enumeration time.
///
/// The descriptor is never refreshed: if the blob changes after the listing
/// page was fetched, the copy still runs against the blob name and whatever
/// content the service holds at copy time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceObjectDescriptor {
    /// Blob name, unique within its container.
    pub name: String,

    /// Content length in bytes.
    pub size_bytes: u64,

    /// Last-modified instant reported by the service.
    pub last_modified: DateTime<Utc>,
}

impl SourceObjectDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            last_modified,
        }
    }
}

/// Properties of a single blob as reported by a HEAD-style request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobProperties {
    pub name: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,

    /// Copy state of the most recent copy that targeted this blob, if any.
    pub copy: Option<crate::models::copy::CopyProgress>,
}

/// One page of a flat listing.
#[derive(Clone, Debug, Default)]
pub struct BlobPage {
    pub items: Vec<SourceObjectDescriptor>,

    /// Opaque continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}
