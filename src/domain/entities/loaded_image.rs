//! Images handed back to callers of the loader.

use bytes::Bytes;

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Served from the in-memory tier.
    MemoryCache,
    /// Served from the disk tier.
    DiskCache,
    /// Received from a concurrent fetch of the same URL.
    InFlight,
    /// Downloaded from network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Image payload together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// URL the caller asked for.
    pub url: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Content type, if known.
    pub content_type: Option<String>,
    /// Source the payload came from.
    pub source: ImageSource,
    /// Whether the payload is now in the cache.
    pub cached: bool,
}
