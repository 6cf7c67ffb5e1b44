//! Delegation credentials and the object-scoped authorization tokens they sign.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use url::Url;

/// Timestamp layout used by SAS query parameters and delegation key requests.
pub const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_sas_time(instant: DateTime<Utc>) -> String {
    instant.format(SAS_TIME_FORMAT).to_string()
}

/// Account-scoped signing secret (a user delegation key).
///
/// Only ever used to sign [`AuthorizationToken`]s; it is never attached to a
/// blob request itself.
#[derive(Clone)]
pub struct DelegationCredential {
    /// Account the key was issued for.
    pub account_name: String,
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: DateTime<Utc>,
    pub signed_expiry: DateTime<Utc>,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64-encoded key material.
    pub value: String,
}

impl DelegationCredential {
    /// True while `now` sits inside the validity window shrunk by `margin` at the far end.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.signed_start <= now && now + margin < self.signed_expiry
    }
}

impl fmt::Debug for DelegationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationCredential")
            .field("account_name", &self.account_name)
            .field("signed_oid", &self.signed_oid)
            .field("signed_tid", &self.signed_tid)
            .field("signed_start", &self.signed_start)
            .field("signed_expiry", &self.signed_expiry)
            .field("signed_service", &self.signed_service)
            .field("signed_version", &self.signed_version)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Blob SAS permission set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SasPermissions {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl SasPermissions {
    /// `racwd`, the set granted to copy sources.
    pub const REPLICATION: Self = Self {
        read: true,
        add: true,
        create: true,
        write: true,
        delete: true,
    };

    /// Parse a permission string; letters outside `racwd` are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let mut perms = Self::default();
        for c in value.chars() {
            match c {
                'r' => perms.read = true,
                'a' => perms.add = true,
                'c' => perms.create = true,
                'w' => perms.write = true,
                'd' => perms.delete = true,
                _ => return None,
            }
        }
        Some(perms)
    }
}

impl fmt::Display for SasPermissions {
    /// Canonical order required by the service: `r a c w d`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, letter) in [
            (self.read, 'r'),
            (self.add, 'a'),
            (self.create, 'c'),
            (self.write, 'w'),
            (self.delete, 'd'),
        ] {
            if set {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

/// Transport constraint carried by a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SasProtocol {
    HttpsOnly,
    HttpsAndHttp,
}

impl SasProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpsOnly => "https",
            Self::HttpsAndHttp => "https,http",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "https" => Some(Self::HttpsOnly),
            "https,http" => Some(Self::HttpsAndHttp),
            _ => None,
        }
    }
}

/// Signed, single-object, time-bounded authorization.
///
/// Minted fresh for every copy; never persisted, never reused for another blob.
#[derive(Clone)]
pub struct AuthorizationToken {
    pub container: String,
    pub blob: String,
    pub permissions: SasPermissions,
    pub starts_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
    pub protocol: SasProtocol,
    /// Serialized query-parameter form, including the signature.
    pub(crate) query: String,
}

impl AuthorizationToken {
    pub fn query_string(&self) -> &str {
        &self.query
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.starts_on <= now && now < self.expires_on
    }

    /// Append this token to a canonical blob URL, replacing any existing query.
    pub fn authorize(&self, canonical: &Url) -> Url {
        let mut url = canonical.clone();
        url.set_query(Some(&self.query));
        url
    }
}

impl fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationToken")
            .field("container", &self.container)
            .field("blob", &self.blob)
            .field("permissions", &self.permissions.to_string())
            .field("starts_on", &self.starts_on)
            .field("expires_on", &self.expires_on)
            .field("protocol", &self.protocol)
            .field("query", &"[REDACTED]")
            .finish()
    }
}
