//! Port for the HTTP side that actually downloads images.

use bytes::Bytes;

use crate::domain::entities::ResponseMetadata;
use crate::domain::ports::CacheResult;

/// Payload and response metadata of one download.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Response body.
    pub payload: Bytes,
    /// Status and headers.
    pub metadata: ResponseMetadata,
}

/// Downloads images. The cache itself never performs network I/O.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ImageFetchPort: Send + Sync {
    /// Fetches the URL. Non-success statuses are returned, not raised.
    async fn fetch(&self, url: &str) -> CacheResult<FetchedImage>;
}
