//! Cached image entries.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::CacheKey;

/// One cached image instance.
///
/// The payload is opaque: the cache never decodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Key the entry is stored under.
    pub key: CacheKey,
    /// Raw payload bytes as received from the network.
    pub payload: Bytes,
    /// Content type reported by the origin (e.g., "image/png").
    pub content_type: Option<String>,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// When the entry was stored.
    pub stored_at: DateTime<Utc>,
    /// End of the freshness window (exclusive). `None` means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// `ETag` validator.
    pub etag: Option<String>,
    /// `Last-Modified` validator.
    pub last_modified: Option<String>,
    /// Last time the entry was read or written.
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a new entry stored at `now`.
    #[must_use]
    pub fn new(key: CacheKey, payload: Bytes, now: DateTime<Utc>) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            key,
            payload,
            content_type: None,
            size_bytes,
            stored_at: now,
            expires_at: None,
            etag: None,
            last_modified: None,
            last_accessed_at: now,
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Sets the expiry.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Sets the `ETag` and `Last-Modified` validators.
    #[must_use]
    pub fn with_validators(mut self, etag: Option<String>, last_modified: Option<String>) -> Self {
        self.etag = etag;
        self.last_modified = last_modified;
        self
    }

    /// An entry whose expiry equals `now` is already expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Returns true if the entry may be served without revalidation.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now)
    }
}
