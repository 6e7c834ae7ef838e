//! Cache keys derived from request URLs.

use serde::{Deserialize, Serialize};
use url::Url;
use url::form_urlencoded;

use crate::domain::ports::{CacheError, CacheResult};

/// Normalized identifier for a cached resource.
///
/// Scheme and host are lowercased, the default port and the fragment are
/// dropped, an empty path becomes `/` and query pairs are sorted, so two
/// requests for the same resource always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives a key from a URL.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidUrl` if the URL cannot be parsed or has no host.
    pub fn from_url(raw: &str) -> CacheResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| CacheError::InvalidUrl(format!("{raw}: {e}")))?;

        let host = url
            .host_str()
            .ok_or_else(|| CacheError::InvalidUrl(format!("{raw}: missing host")))?;

        let mut key = format!("{}://{}", url.scheme(), host.to_ascii_lowercase());
        if let Some(port) = url.port() {
            key.push(':');
            key.push_str(&port.to_string());
        }

        let path = url.path();
        key.push_str(if path.is_empty() { "/" } else { path });

        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        if !pairs.is_empty() {
            pairs.sort();
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push('?');
            key.push_str(&query);
        }

        Ok(Self(key))
    }

    /// Returns the normalized key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe identifier for the on-disk entry.
    #[must_use]
    pub fn storage_id(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
