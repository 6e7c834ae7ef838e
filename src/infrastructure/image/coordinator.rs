//! Two-tier cache orchestration.
//!
//! Lookups go Memory -> Disk (promoting disk hits). Stores run the freshness
//! rules, then write through memory and disk. At most one population per key
//! is active at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::application::services::{FreshnessEvaluator, StorePolicy};
use crate::domain::entities::{CacheEntry, CacheKey, ImageSource, ResponseMetadata};
use crate::domain::ports::{
    CacheError, CacheResult, Clock, ImageCachePort, StoreOutcome, SystemClock, Tier,
};

use super::disk_cache::{DEFAULT_DISK_BUDGET, DiskImageCache};
use super::in_flight::{FetchWaiter, InFlightRegistry, Lease, Population, Registration};
use super::memory_cache::{DEFAULT_MEMORY_BUDGET, MemoryImageCache};
use super::stats::CacheStats;

/// Configuration for the image cache. Budgets are fixed once the cache is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheConfig {
    /// Maximum bytes resident in memory.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,
    /// Maximum bytes kept on disk.
    #[serde(default = "default_disk_budget")]
    pub disk_budget_bytes: u64,
    /// Disk cache directory. Defaults to the platform cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

pub(crate) const fn default_memory_budget() -> u64 {
    DEFAULT_MEMORY_BUDGET
}

pub(crate) const fn default_disk_budget() -> u64 {
    DEFAULT_DISK_BUDGET
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            disk_budget_bytes: DEFAULT_DISK_BUDGET,
            cache_dir: None,
        }
    }
}

impl ImageCacheConfig {
    /// Returns the configured directory or the platform default
    /// (~/.cache/pixcache/images/ on Linux).
    #[must_use]
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "pixcache", "pixcache").map_or_else(
        || {
            std::env::temp_dir()
                .join("pixcache")
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}

/// Result of [`ImageCache::begin_fetch`].
pub enum FetchTicket<'a> {
    /// The caller owns the population: fetch, then complete or release.
    Leader(FetchGuard<'a>),
    /// Another caller is fetching the same key.
    Follower(FetchWaiter),
}

/// Registration held by the caller that fetches a key.
///
/// Dropping the guard without completing it releases the key with a failure.
pub struct FetchGuard<'a> {
    cache: &'a ImageCache,
    lease: Lease,
}

impl FetchGuard<'_> {
    /// Key being populated.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        self.lease.key()
    }

    /// Stores the fetched payload as this key's population.
    ///
    /// # Errors
    /// Returns `CacheError::BudgetTooSmall` if the entry cannot fit a tier.
    pub async fn complete(
        self,
        payload: Bytes,
        metadata: &ResponseMetadata,
    ) -> CacheResult<StoreOutcome> {
        self.cache.populate(self.lease, payload, metadata).await
    }

    /// Releases the key after a failed fetch, waking waiters with the reason.
    pub fn release(self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(key = %self.lease.key(), reason = %reason, "Fetch released without storing");
        self.lease.resolve(Population::Failed(reason));
    }
}

/// Public entry point of the cache: explicitly constructed and owned by the
/// host application.
pub struct ImageCache {
    memory: MemoryImageCache,
    disk: DiskImageCache,
    in_flight: Arc<InFlightRegistry>,
    clock: Arc<dyn Clock>,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("cache_dir", &self.disk.cache_dir())
            .field("memory_budget", &self.memory.budget())
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Opens the cache described by `config`.
    ///
    /// # Errors
    /// Returns error if the disk cache directory cannot be created or read.
    pub async fn open(config: &ImageCacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        for (tier, budget) in [
            (Tier::Memory, config.memory_budget_bytes),
            (Tier::Disk, config.disk_budget_bytes),
        ] {
            if budget == 0 {
                warn!(tier = %tier, "Cache budget is zero, every store will be rejected");
            }
        }

        let cache_dir = config.effective_cache_dir();
        let disk = DiskImageCache::open(cache_dir.clone(), config.disk_budget_bytes, clock.now())
            .await?;
        let memory = MemoryImageCache::new(config.memory_budget_bytes);

        info!(
            cache_dir = %cache_dir.display(),
            memory_budget = config.memory_budget_bytes,
            disk_budget = config.disk_budget_bytes,
            "Image cache opened"
        );

        Ok(Self::with_tiers(memory, disk, clock))
    }

    /// Opens a cache with default budgets in the default location.
    ///
    /// # Errors
    /// Returns error if the disk cache directory cannot be created or read.
    pub async fn with_defaults() -> CacheResult<Self> {
        Self::open(&ImageCacheConfig::default(), Arc::new(SystemClock)).await
    }

    /// Assembles a cache from already constructed tiers.
    #[must_use]
    pub fn with_tiers(memory: MemoryImageCache, disk: DiskImageCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory,
            disk,
            in_flight: Arc::new(InFlightRegistry::new()),
            clock,
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Looks up a fresh entry. Never fails: every problem is reported as a miss.
    pub async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        self.lookup_with_source(url)
            .await
            .map(|(entry, _)| entry)
    }

    /// Like [`Self::lookup`], also reporting which tier served the entry.
    pub async fn lookup_with_source(&self, url: &str) -> Option<(CacheEntry, ImageSource)> {
        let key = match CacheKey::from_url(url) {
            Ok(key) => key,
            Err(e) => {
                debug!(url = url, error = %e, "Lookup for uncacheable URL");
                return None;
            }
        };
        let now = self.clock.now();
        let generation = self.memory.generation();

        if let Some(entry) = self.memory.get(&key, now) {
            if entry.is_fresh(now) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some((entry, ImageSource::MemoryCache));
            }
            trace!(key = %key, "Memory entry expired");
        }

        if let Some(entry) = self.disk.get(&key, now).await {
            if entry.is_fresh(now) {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                match self.memory.promote(entry.clone(), generation, now) {
                    Ok(true) => debug!(key = %key, "Promoted disk hit into memory"),
                    Ok(false) => {}
                    Err(e) => debug!(key = %key, error = %e, "Disk hit not promoted"),
                }
                return Some((entry, ImageSource::DiskCache));
            }
            trace!(key = %key, "Disk entry expired");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Cache miss");
        None
    }

    /// Stores a fetched payload.
    ///
    /// If a population for the key is already active, or one completed while
    /// this call was waiting to register, the payload is discarded and
    /// `StoreOutcome::Deduplicated` is returned; the first population wins.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidUrl` for URLs that cannot be keyed and
    /// `CacheError::BudgetTooSmall` if the entry cannot fit a tier at all.
    /// Disk write failures are not errors; see `StoreOutcome::MemoryOnly`.
    pub async fn store(
        &self,
        url: &str,
        payload: Bytes,
        metadata: &ResponseMetadata,
    ) -> CacheResult<StoreOutcome> {
        let key = CacheKey::from_url(url)?;
        let call = self.in_flight.enter();
        match self.in_flight.register_call(&call, &key) {
            Some(Registration::Leader(lease)) => self.populate(lease, payload, metadata).await,
            Some(Registration::Follower(_)) => {
                debug!(key = %key, "Population already in flight, discarding payload");
                Ok(StoreOutcome::Deduplicated)
            }
            None => {
                debug!(key = %key, "Population stored concurrently, discarding payload");
                Ok(StoreOutcome::Deduplicated)
            }
        }
    }

    /// Registers the caller as the fetcher of `url` before it goes to the
    /// network, or hands back a waiter if someone else already is.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidUrl` for URLs that cannot be keyed.
    pub fn begin_fetch(&self, url: &str) -> CacheResult<FetchTicket<'_>> {
        let key = CacheKey::from_url(url)?;
        Ok(match self.in_flight.register(&key) {
            Registration::Leader(lease) => FetchTicket::Leader(FetchGuard { cache: self, lease }),
            Registration::Follower(waiter) => FetchTicket::Follower(waiter),
        })
    }

    /// Removes the URL from both tiers and cancels any registration for it.
    /// Invalidating an absent URL is a no-op.
    pub async fn invalidate(&self, url: &str) {
        let Ok(key) = CacheKey::from_url(url) else {
            return;
        };
        self.in_flight.cancel(&key);
        self.remove_from_tiers(&key).await;
        debug!(key = %key, "Invalidated cache entry");
    }

    /// Removes expired entries from both tiers. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let purged = self.memory.purge_expired(now) + self.disk.purge_expired(now).await;
        info!(count = purged, "Purged expired cache entries");
        purged
    }

    /// Clears both tiers.
    ///
    /// # Errors
    /// Returns error if the disk cache directory cannot be read.
    pub async fn clear(&self) -> CacheResult<()> {
        self.memory.clear();
        self.disk.clear().await?;
        info!("Cleared all image caches");
        Ok(())
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let disk_hits = self.disk_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            memory_hits,
            disk_hits,
            misses,
            hit_rate: CacheStats::hit_rate(memory_hits, disk_hits, misses),
            stores: self.stores.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
            memory: self.memory.usage(),
            disk: self.disk.usage(),
        }
    }

    /// Memory tier, for inspection.
    #[must_use]
    pub const fn memory(&self) -> &MemoryImageCache {
        &self.memory
    }

    /// Disk tier, for inspection.
    #[must_use]
    pub const fn disk(&self) -> &DiskImageCache {
        &self.disk
    }

    async fn populate(
        &self,
        lease: Lease,
        payload: Bytes,
        metadata: &ResponseMetadata,
    ) -> CacheResult<StoreOutcome> {
        let now = self.clock.now();
        let key = lease.key().clone();
        let result = self.write_through(&key, payload, metadata, now).await;

        if !lease.is_current() {
            if let Ok((_, Some(entry))) = &result {
                self.disk.remove_matching(entry).await;
                self.memory.remove_matching(entry);
                debug!(key = %key, "Invalidated during population, withdrew written entry");
            }
            lease.resolve(Population::Invalidated);
            return result.map(|_| StoreOutcome::NotStored);
        }

        let population = match &result {
            Ok((_, Some(entry))) => Population::Stored(entry.clone()),
            Ok((_, None)) => Population::NotStored,
            Err(e) => Population::Failed(e.to_string()),
        };
        lease.resolve(population);

        result.map(|(outcome, _)| outcome)
    }

    async fn write_through(
        &self,
        key: &CacheKey,
        payload: Bytes,
        metadata: &ResponseMetadata,
        now: DateTime<Utc>,
    ) -> CacheResult<(StoreOutcome, Option<CacheEntry>)> {
        let policy = FreshnessEvaluator::evaluate(metadata, now);
        if policy == StorePolicy::DoNotStore {
            debug!(key = %key, status = metadata.status(), "Response not storable, dropping cached copies");
            self.remove_from_tiers(key).await;
            return Ok((StoreOutcome::NotStored, None));
        }

        let entry = CacheEntry::new(key.clone(), payload, now)
            .with_content_type(metadata.content_type().map(String::from))
            .with_expiry(policy.expires_at())
            .with_validators(
                metadata.etag().map(String::from),
                metadata.last_modified().map(String::from),
            );

        if entry.expires_at.is_some_and(|expires| expires < now) {
            debug!(key = %key, "Response already expired on arrival, dropping cached copies");
            self.remove_from_tiers(key).await;
            return Ok((StoreOutcome::NotStored, None));
        }

        if let Some(err) = self.oversize(entry.size_bytes) {
            warn!(key = %key, error = %err, "Entry cannot fit the cache");
            self.remove_from_tiers(key).await;
            return Err(err);
        }

        self.memory.put(entry.clone(), now)?;

        let outcome = match self.disk.put(&entry, now).await {
            Ok(()) => StoreOutcome::Stored,
            Err(e) => {
                warn!(key = %key, error = %e, "Disk write failed, entry cached in memory only");
                StoreOutcome::MemoryOnly { disk_error: e }
            }
        };

        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, size = entry.size_bytes, expires_at = ?entry.expires_at, "Stored entry");
        Ok((outcome, Some(entry)))
    }

    fn oversize(&self, size: u64) -> Option<CacheError> {
        [
            (Tier::Memory, self.memory.budget()),
            (Tier::Disk, self.disk.usage().budget),
        ]
        .into_iter()
        .find(|(_, budget)| size > *budget)
        .map(|(tier, budget)| CacheError::BudgetTooSmall {
            tier,
            entry_size: size,
            budget,
        })
    }

    /// Disk goes first, so a lookup that reads memory's generation after
    /// this removal no longer finds the entry on disk.
    async fn remove_from_tiers(&self, key: &CacheKey) {
        self.disk.remove(key).await;
        self.memory.remove(key);
    }
}

#[async_trait::async_trait]
impl ImageCachePort for ImageCache {
    async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        Self::lookup(self, url).await
    }

    async fn store(
        &self,
        url: &str,
        payload: Bytes,
        metadata: &ResponseMetadata,
    ) -> CacheResult<StoreOutcome> {
        Self::store(self, url, payload, metadata).await
    }

    async fn invalidate(&self, url: &str) {
        Self::invalidate(self, url).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::{ManualClock, MockClock};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const URL: &str = "https://cdn.example.com/img/cat.png?w=64&h=64";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn create_test_cache(
        memory_budget: u64,
        disk_budget: u64,
    ) -> (ImageCache, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at(t0()));
        let config = ImageCacheConfig {
            memory_budget_bytes: memory_budget,
            disk_budget_bytes: disk_budget,
            cache_dir: Some(temp_dir.path().to_path_buf()),
        };
        let cache = ImageCache::open(&config, clock.clone()).await.unwrap();
        (cache, clock, temp_dir)
    }

    fn ok_response(cache_control: &str) -> ResponseMetadata {
        ResponseMetadata::new(200)
            .with_header("Cache-Control", cache_control)
            .with_header("Content-Type", "image/png")
            .with_header("ETag", "\"abc\"")
    }

    #[tokio::test]
    async fn test_round_trip_returns_identical_entry() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let payload = Bytes::from_static(b"\x89PNG fake image");

        let outcome = cache
            .store(URL, payload.clone(), &ok_response("max-age=600"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        let entry = cache.lookup(URL).await.unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.content_type.as_deref(), Some("image/png"));
        assert_eq!(entry.etag.as_deref(), Some("\"abc\""));
        assert_eq!(entry.stored_at, t0());
        assert_eq!(entry.expires_at, Some(t0() + chrono::TimeDelta::seconds(600)));

        let from_disk = cache.disk().get(&entry.key, t0()).await.unwrap();
        assert_eq!(from_disk, entry);
    }

    #[tokio::test]
    async fn test_equivalent_urls_share_an_entry() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();

        let reordered = "HTTPS://CDN.example.com/img/cat.png?h=64&w=64#preview";
        assert!(cache.lookup(reordered).await.is_some());
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();
        cache.memory().clear();

        let (_, source) = cache.lookup_with_source(URL).await.unwrap();
        assert_eq!(source, ImageSource::DiskCache);
        let (_, source) = cache.lookup_with_source(URL).await.unwrap();
        assert_eq!(source, ImageSource::MemoryCache);

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_exclusive() {
        let (cache, clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=10"))
            .await
            .unwrap();

        clock.advance_secs(9);
        assert!(cache.lookup(URL).await.is_some());
        clock.advance_secs(1);
        assert!(cache.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_removed_on_lookup() {
        let (cache, clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=1"))
            .await
            .unwrap();
        clock.advance_secs(5);

        assert!(cache.lookup(URL).await.is_none());
        assert_eq!(cache.memory().len(), 1);
        assert_eq!(cache.disk().len(), 1);

        assert_eq!(cache.purge_expired().await, 2);
        assert!(cache.memory().is_empty());
        assert!(cache.disk().is_empty());
    }

    #[tokio::test]
    async fn test_max_age_zero_is_stored_but_never_served() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let outcome = cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=0"))
            .await
            .unwrap();

        assert_eq!(outcome, StoreOutcome::Stored);
        assert_eq!(cache.memory().len(), 1);
        assert!(cache.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn test_no_store_removes_previous_entry() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"old"), &ok_response("max-age=600"))
            .await
            .unwrap();
        assert!(cache.lookup(URL).await.is_some());

        let outcome = cache
            .store(URL, Bytes::from_static(b"new"), &ok_response("no-store"))
            .await
            .unwrap();

        assert_eq!(outcome, StoreOutcome::NotStored);
        assert!(cache.lookup(URL).await.is_none());
        assert!(cache.memory().is_empty());
        assert!(cache.disk().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_not_stored() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let outcome = cache
            .store(URL, Bytes::from_static(b"oops"), &ResponseMetadata::new(404))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::NotStored);
        assert!(cache.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn test_past_expires_header_is_not_stored() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let metadata =
            ResponseMetadata::new(200).with_header("Expires", "Wed, 01 May 2024 11:00:00 GMT");
        let outcome = cache
            .store(URL, Bytes::from_static(b"img"), &metadata)
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::NotStored);
        assert!(cache.memory().is_empty());
    }

    #[tokio::test]
    async fn test_disk_failure_still_serves_from_memory() {
        let (cache, _clock, temp) = create_test_cache(1024, 4096).await;
        let dir = temp.path().to_path_buf();
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"not a directory").unwrap();

        let outcome = cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StoreOutcome::MemoryOnly {
                disk_error: CacheError::DiskWrite(_)
            }
        ));
        assert!(outcome.is_cached());
        let (entry, source) = cache.lookup_with_source(URL).await.unwrap();
        assert_eq!(&entry.payload[..], b"img");
        assert_eq!(source, ImageSource::MemoryCache);

        std::fs::remove_file(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_entry_too_large_is_a_hard_failure() {
        let (cache, _clock, _temp) = create_test_cache(4, 4096).await;
        let err = cache
            .store(URL, Bytes::from_static(b"12345"), &ok_response("max-age=60"))
            .await
            .unwrap_err();

        assert!(err.is_config_error());
        assert!(matches!(err, CacheError::BudgetTooSmall { tier: Tier::Memory, .. }));
        assert!(cache.disk().is_empty());
        assert!(!cache.in_flight.is_active(&CacheKey::from_url(URL).unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        assert!(cache.lookup("::nope::").await.is_none());
        assert!(matches!(
            cache
                .store("::nope::", Bytes::new(), &ResponseMetadata::new(200))
                .await,
            Err(CacheError::InvalidUrl(_))
        ));
        cache.invalidate("::nope::").await;
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();

        cache.invalidate(URL).await;
        assert!(cache.lookup(URL).await.is_none());
        assert!(cache.memory().is_empty());
        assert!(cache.disk().is_empty());

        cache.invalidate(URL).await;
        assert!(cache.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn test_store_during_active_fetch_is_discarded() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;

        let FetchTicket::Leader(guard) = cache.begin_fetch(URL).unwrap() else {
            panic!("first fetch should lead");
        };
        let FetchTicket::Follower(waiter) = cache.begin_fetch(URL).unwrap() else {
            panic!("second fetch should follow");
        };

        for i in 1..10u8 {
            let outcome = cache
                .store(URL, Bytes::from(vec![i]), &ok_response("max-age=60"))
                .await
                .unwrap();
            assert_eq!(outcome, StoreOutcome::Deduplicated);
        }
        assert!(cache.lookup(URL).await.is_none());

        let outcome = guard
            .complete(Bytes::from(vec![0u8]), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        match waiter.wait().await {
            Population::Stored(entry) => assert_eq!(&entry.payload[..], &[0u8]),
            other => panic!("unexpected population: {other:?}"),
        }
        assert_eq!(&cache.lookup(URL).await.unwrap().payload[..], &[0u8]);
    }

    #[tokio::test]
    async fn test_released_fetch_unblocks_waiters_and_key() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;

        let FetchTicket::Leader(guard) = cache.begin_fetch(URL).unwrap() else {
            panic!("first fetch should lead");
        };
        let FetchTicket::Follower(waiter) = cache.begin_fetch(URL).unwrap() else {
            panic!("second fetch should follow");
        };

        guard.release("connection reset");
        assert_eq!(
            waiter.wait().await,
            Population::Failed("connection reset".to_string())
        );
        assert!(matches!(
            cache.begin_fetch(URL).unwrap(),
            FetchTicket::Leader(_)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_cancels_registration() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;

        let FetchTicket::Leader(_guard) = cache.begin_fetch(URL).unwrap() else {
            panic!("first fetch should lead");
        };
        let FetchTicket::Follower(waiter) = cache.begin_fetch(URL).unwrap() else {
            panic!("second fetch should follow");
        };

        cache.invalidate(URL).await;
        assert_eq!(waiter.wait().await, Population::Invalidated);

        let outcome = cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_leave_one_consistent_payload() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let cache = Arc::new(cache);

        // The winner stalls on its disk write until every other store is done.
        let held = cache.disk().hold_file_reads().await;
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..10u8 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move {
                let outcome = cache
                    .store(URL, Bytes::from(vec![i; 8]), &ok_response("max-age=60"))
                    .await
                    .unwrap();
                (i, outcome)
            });
        }

        let mut outcomes = Vec::new();
        for _ in 0..9 {
            outcomes.push(tasks.join_next().await.unwrap().unwrap());
        }
        assert!(outcomes.iter().all(|(_, o)| *o == StoreOutcome::Deduplicated));

        drop(held);
        outcomes.push(tasks.join_next().await.unwrap().unwrap());

        let stored: Vec<u8> = outcomes
            .iter()
            .filter(|(_, o)| *o == StoreOutcome::Stored)
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(stored.len(), 1);
        let winner = vec![stored[0]; 8];

        let key = CacheKey::from_url(URL).unwrap();
        assert_eq!(&cache.memory().peek(&key).unwrap().payload[..], &winner[..]);
        assert_eq!(&cache.disk().get(&key, t0()).await.unwrap().payload[..], &winner[..]);
        assert_eq!(cache.memory().len(), 1);
        assert_eq!(cache.disk().len(), 1);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_during_population_withdraws_entry() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;

        let FetchTicket::Leader(guard) = cache.begin_fetch(URL).unwrap() else {
            panic!("first fetch should lead");
        };
        cache.invalidate(URL).await;

        let outcome = guard
            .complete(Bytes::from_static(b"stale"), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::NotStored);

        assert!(cache.lookup(URL).await.is_none());
        assert!(cache.memory().is_empty());
        assert!(cache.disk().is_empty());
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_keeps_entry_stored_after_invalidation() {
        let (cache, clock, _temp) = create_test_cache(1024, 4096).await;

        let FetchTicket::Leader(guard) = cache.begin_fetch(URL).unwrap() else {
            panic!("first fetch should lead");
        };
        cache.invalidate(URL).await;

        let outcome = guard
            .complete(Bytes::from_static(b"stale"), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::NotStored);

        clock.advance_secs(1);
        cache
            .store(URL, Bytes::from_static(b"fresh"), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert_eq!(&cache.lookup(URL).await.unwrap().payload[..], b"fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lookup_racing_invalidate_never_resurrects_entry() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let cache = Arc::new(cache);
        let key = CacheKey::from_url(URL).unwrap();

        for _ in 0..100 {
            cache
                .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
                .await
                .unwrap();
            cache.memory().clear();

            let reader = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.lookup(URL).await })
            };
            let invalidator = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.invalidate(URL).await })
            };
            reader.await.unwrap();
            invalidator.await.unwrap();

            assert!(cache.memory().peek(&key).is_none());
            assert!(cache.disk().is_empty());
            assert!(cache.lookup(URL).await.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lookup_racing_store_never_restores_older_payload() {
        let (cache, clock, _temp) = create_test_cache(1024, 4096).await;
        let cache = Arc::new(cache);
        let key = CacheKey::from_url(URL).unwrap();

        for round in 0..100u8 {
            cache
                .store(URL, Bytes::from(vec![round; 4]), &ok_response("max-age=600"))
                .await
                .unwrap();
            cache.memory().clear();
            clock.advance_secs(1);

            let newer = Bytes::from(vec![round; 8]);
            let reader = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.lookup(URL).await })
            };
            let writer = {
                let cache = Arc::clone(&cache);
                let newer = newer.clone();
                tokio::spawn(async move {
                    cache.store(URL, newer, &ok_response("max-age=600")).await
                })
            };
            reader.await.unwrap();
            assert_eq!(writer.await.unwrap().unwrap(), StoreOutcome::Stored);

            assert_eq!(cache.memory().peek(&key).unwrap().payload, newer);
            assert_eq!(cache.disk().get(&key, clock.now()).await.unwrap().payload, newer);
        }
    }

    #[tokio::test]
    async fn test_memory_budget_evicts_least_recent() {
        let (cache, clock, _temp) = create_test_cache(30, 4096).await;
        for name in ["a", "b", "c"] {
            cache
                .store(
                    &format!("https://example.com/{name}.png"),
                    Bytes::from(vec![1u8; 10]),
                    &ok_response("max-age=600"),
                )
                .await
                .unwrap();
            clock.advance_secs(1);
        }

        assert!(cache.lookup("https://example.com/a.png").await.is_some());
        clock.advance_secs(1);
        cache
            .store(
                "https://example.com/d.png",
                Bytes::from(vec![1u8; 10]),
                &ok_response("max-age=600"),
            )
            .await
            .unwrap();

        let b = CacheKey::from_url("https://example.com/b.png").unwrap();
        assert!(cache.memory().peek(&b).is_none());
        assert!(cache.memory().resident_bytes() <= 30);
        // Still on disk, so the lookup is served from there.
        let (_, source) = cache
            .lookup_with_source("https://example.com/b.png")
            .await
            .unwrap();
        assert_eq!(source, ImageSource::DiskCache);
    }

    #[tokio::test]
    async fn test_clock_is_consulted_for_store_time() {
        let temp_dir = TempDir::new().unwrap();
        let mut clock = MockClock::new();
        clock.expect_now().return_const(t0());
        let config = ImageCacheConfig {
            cache_dir: Some(temp_dir.path().to_path_buf()),
            ..ImageCacheConfig::default()
        };
        let cache = ImageCache::open(&config, Arc::new(clock)).await.unwrap();

        cache
            .store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();
        let entry = cache.lookup(URL).await.unwrap();
        assert_eq!(entry.stored_at, t0());
        assert_eq!(entry.last_accessed_at, t0());
    }

    #[tokio::test]
    async fn test_usable_through_port() {
        let (cache, _clock, _temp) = create_test_cache(1024, 4096).await;
        let port: Arc<dyn ImageCachePort> = Arc::new(cache);

        port.store(URL, Bytes::from_static(b"img"), &ok_response("max-age=60"))
            .await
            .unwrap();
        assert!(port.lookup(URL).await.is_some());
        port.invalidate(URL).await;
        assert!(port.lookup(URL).await.is_none());
    }
}
