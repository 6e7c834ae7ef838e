//! HTTP image downloads.

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use tracing::{debug, warn};

use crate::domain::entities::ResponseMetadata;
use crate::domain::ports::{CacheError, CacheResult, FetchedImage, ImageFetchPort};

/// Downloads images with `reqwest`.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
}

impl ImageFetcher {
    /// Creates a fetcher sending `user_agent` and giving up after `timeout_secs`.
    ///
    /// # Errors
    /// Returns error if HTTP client creation fails.
    pub fn new(user_agent: &str, timeout_secs: u64) -> CacheResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CacheError::NetworkError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetchPort for ImageFetcher {
    async fn fetch(&self, url: &str) -> CacheResult<FetchedImage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::NetworkError(format!("Request failed: {e}")))?;

        let metadata = metadata_from_response(response.status().as_u16(), response.headers());
        if !response.status().is_success() {
            warn!(url = url, status = %response.status(), "Image request failed");
        }

        let payload = response
            .bytes()
            .await
            .map_err(|e| CacheError::NetworkError(format!("Failed to read body: {e}")))?;

        debug!(url = url, status = metadata.status(), size = payload.len(), "Fetched image");
        Ok(FetchedImage { payload, metadata })
    }
}

/// Converts a status and header map into [`ResponseMetadata`].
/// Headers whose values are not visible ASCII are skipped.
#[must_use]
pub fn metadata_from_response(status: u16, headers: &HeaderMap) -> ResponseMetadata {
    let mut metadata = ResponseMetadata::new(status);
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => metadata.insert_header(name.as_str(), value),
            Err(_) => debug!(header = %name, "Skipping non-ASCII header value"),
        }
    }
    metadata
}
