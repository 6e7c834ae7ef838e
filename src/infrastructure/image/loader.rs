//! Async image loading orchestrator.
//!
//! Checks the cache first (Memory -> Disk), then goes to the network through
//! an [`ImageFetchPort`]. Concurrent loads of one URL share a single download.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::entities::{CacheEntry, ImageSource, LoadedImage, ResponseMetadata};
use crate::domain::ports::{CacheError, CacheResult, ImageFetchPort, StoreOutcome};

use super::coordinator::{FetchTicket, ImageCache};
use super::in_flight::Population;

/// Default number of downloads allowed at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Loads images through the cache, downloading on a miss.
pub struct ImageLoader {
    cache: Arc<ImageCache>,
    fetcher: Arc<dyn ImageFetchPort>,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("cache", &self.cache)
            .field("available_permits", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates a loader with the default download concurrency.
    #[must_use]
    pub fn new(cache: Arc<ImageCache>, fetcher: Arc<dyn ImageFetchPort>) -> Self {
        Self::with_concurrency(cache, fetcher, DEFAULT_MAX_CONCURRENT_DOWNLOADS)
    }

    /// Creates a loader allowing `max_concurrent_downloads` downloads at once.
    #[must_use]
    pub fn with_concurrency(
        cache: Arc<ImageCache>,
        fetcher: Arc<dyn ImageFetchPort>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
        }
    }

    /// The cache this loader reads and populates.
    #[must_use]
    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Loads an image, checking caches first.
    ///
    /// # Errors
    /// Returns error if the URL cannot be keyed, the download fails, or the
    /// server answers with a non-success status.
    pub async fn load(&self, url: &str) -> CacheResult<LoadedImage> {
        if let Some((entry, source)) = self.cache.lookup_with_source(url).await {
            return Ok(loaded_from_entry(url, entry, source));
        }

        match self.cache.begin_fetch(url)? {
            FetchTicket::Leader(guard) => {
                let fetched = match self.download(url).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        guard.release(e.to_string());
                        return Err(e);
                    }
                };
                let outcome = guard
                    .complete(fetched.payload.clone(), &fetched.metadata)
                    .await;
                finish_network_load(url, fetched.payload, &fetched.metadata, outcome)
            }
            FetchTicket::Follower(waiter) => match waiter.wait().await {
                Population::Stored(entry) => {
                    Ok(loaded_from_entry(url, entry, ImageSource::InFlight))
                }
                other => {
                    debug!(url = url, population = ?other, "Shared fetch produced nothing, fetching directly");
                    self.load_uncoordinated(url).await
                }
            },
        }
    }

    /// Loads several images concurrently, one result per URL in input order.
    pub async fn load_batch(&self, urls: &[String]) -> Vec<CacheResult<LoadedImage>> {
        join_all(urls.iter().map(|url| self.load(url))).await
    }

    /// Downloads and stores without joining an in-flight registration.
    async fn load_uncoordinated(&self, url: &str) -> CacheResult<LoadedImage> {
        let fetched = self.download(url).await?;
        let outcome = self
            .cache
            .store(url, fetched.payload.clone(), &fetched.metadata)
            .await;
        finish_network_load(url, fetched.payload, &fetched.metadata, outcome)
    }

    async fn download(&self, url: &str) -> CacheResult<crate::domain::ports::FetchedImage> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| CacheError::NetworkError(format!("Download queue closed: {e}")))?;

        debug!(url = url, "Downloading image from network");
        let fetched = self.fetcher.fetch(url).await?;

        let status = fetched.metadata.status();
        if !(200..300).contains(&status) {
            return Err(CacheError::NetworkError(format!("HTTP {status}")));
        }
        Ok(fetched)
    }
}

fn loaded_from_entry(url: &str, entry: CacheEntry, source: ImageSource) -> LoadedImage {
    LoadedImage {
        url: url.to_string(),
        payload: entry.payload,
        content_type: entry.content_type,
        source,
        cached: true,
    }
}

fn finish_network_load(
    url: &str,
    payload: Bytes,
    metadata: &ResponseMetadata,
    outcome: CacheResult<StoreOutcome>,
) -> CacheResult<LoadedImage> {
    let cached = match outcome {
        Ok(outcome) => outcome.is_cached(),
        Err(e) if e.is_config_error() => {
            warn!(url = url, error = %e, "Image too large to cache, serving uncached");
            false
        }
        Err(e) => return Err(e),
    };

    debug!(url = url, source = "network", cached = cached, "Image loaded");
    Ok(LoadedImage {
        url: url.to_string(),
        payload,
        content_type: metadata.content_type().map(String::from),
        source: ImageSource::Network,
        cached,
    })
}
