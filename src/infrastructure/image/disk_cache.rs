//! Disk-based image cache for persistence across sessions.
//!
//! Each entry is a payload file (`<id>.img`) plus a JSON metadata record
//! (`<id>.meta.json`). Payloads are written before metadata and metadata is
//! removed before payloads, so a metadata record on disk always points at a
//! complete payload unless something outside the cache interfered.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::application::services::{EvictionCandidate, EvictionManager};
use crate::domain::entities::{CacheEntry, CacheKey};
use crate::domain::ports::{CacheError, CacheResult, Tier};

use super::stats::TierUsage;

/// Maximum disk cache size in bytes (500 MB default).
pub const DEFAULT_DISK_BUDGET: u64 = 500 * 1024 * 1024;

const PAYLOAD_SUFFIX: &str = ".img";
const METADATA_SUFFIX: &str = ".meta.json";
const TEMP_SUFFIX: &str = ".tmp";

/// Sidecar metadata persisted next to each payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    key: CacheKey,
    content_type: Option<String>,
    size_bytes: u64,
    stored_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    etag: Option<String>,
    last_modified: Option<String>,
    last_accessed_at: DateTime<Utc>,
}

impl EntryRecord {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            content_type: entry.content_type.clone(),
            size_bytes: entry.size_bytes,
            stored_at: entry.stored_at,
            expires_at: entry.expires_at,
            etag: entry.etag.clone(),
            last_modified: entry.last_modified.clone(),
            last_accessed_at: entry.last_accessed_at,
        }
    }

    fn into_entry(self, payload: Bytes) -> CacheEntry {
        CacheEntry {
            key: self.key,
            payload,
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            stored_at: self.stored_at,
            expires_at: self.expires_at,
            etag: self.etag,
            last_modified: self.last_modified,
            last_accessed_at: self.last_accessed_at,
        }
    }

    fn same_version(&self, other: &Self) -> bool {
        self.stored_at == other.stored_at && self.size_bytes == other.size_bytes
    }

    fn candidate(&self) -> EvictionCandidate {
        EvictionCandidate {
            key: self.key.clone(),
            size_bytes: self.size_bytes,
            last_accessed_at: self.last_accessed_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Default)]
struct DiskIndex {
    records: HashMap<CacheKey, EntryRecord>,
    total_bytes: u64,
}

impl DiskIndex {
    fn insert(&mut self, record: EntryRecord) {
        let size = record.size_bytes;
        if let Some(old) = self.records.insert(record.key.clone(), record) {
            self.total_bytes -= old.size_bytes;
        }
        self.total_bytes += size;
    }

    fn take(&mut self, key: &CacheKey) -> Option<EntryRecord> {
        let record = self.records.remove(key)?;
        self.total_bytes -= record.size_bytes;
        Some(record)
    }

    /// Removes victims from the index and returns them; file deletion is the
    /// caller's job once the lock is released.
    fn evict(&mut self, bytes_to_free: u64, keep: Option<&CacheKey>, now: DateTime<Utc>) -> Vec<CacheKey> {
        let snapshot: Vec<EvictionCandidate> = self
            .records
            .values()
            .filter(|r| keep != Some(&r.key))
            .map(EntryRecord::candidate)
            .collect();
        let plan = EvictionManager::select_victims(&snapshot, bytes_to_free, now);
        if !plan.satisfied {
            warn!(
                needed = bytes_to_free,
                freed = plan.bytes_freed,
                "Disk eviction could not free enough space"
            );
        }
        for victim in &plan.victims {
            self.take(victim);
        }
        plan.victims
    }
}

/// Disk-based cache that persists raw payloads with sidecar metadata.
///
/// `index` guards the in-memory bookkeeping and is never held across I/O.
/// `files` orders file operations: reads share it, anything that creates,
/// replaces or deletes files takes it exclusively.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    budget: u64,
    index: Mutex<DiskIndex>,
    files: RwLock<()>,
    evictions: AtomicU64,
}

impl DiskImageCache {
    /// Opens (or creates) a disk cache in `cache_dir`, rebuilding the index
    /// from the metadata records found there.
    ///
    /// Orphaned metadata, stray payloads and leftover temp files are removed.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created or read.
    pub async fn open(cache_dir: PathBuf, budget: u64, now: DateTime<Utc>) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let mut metadata_files: Vec<(String, PathBuf)> = Vec::new();
        let mut payload_sizes: HashMap<String, u64> = HashMap::new();

        let mut entries = fs::read_dir(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            if name.ends_with(TEMP_SUFFIX) {
                remove_file_quietly(&path).await;
            } else if let Some(id) = name.strip_suffix(METADATA_SUFFIX) {
                metadata_files.push((id.to_string(), path));
            } else if let Some(id) = name.strip_suffix(PAYLOAD_SUFFIX)
                && let Ok(meta) = entry.metadata().await
            {
                payload_sizes.insert(id.to_string(), meta.len());
            }
        }

        let mut index = DiskIndex::default();
        let mut valid_ids = HashSet::new();

        for (id, path) in metadata_files {
            match load_record(&path).await {
                Some(record)
                    if record.key.storage_id() == id
                        && payload_sizes.get(&id) == Some(&record.size_bytes) =>
                {
                    valid_ids.insert(id);
                    index.insert(record);
                }
                _ => {
                    warn!(path = %path.display(), "Removing orphaned cache metadata");
                    remove_file_quietly(&path).await;
                }
            }
        }

        for id in payload_sizes.keys().filter(|id| !valid_ids.contains(*id)) {
            let path = cache_dir.join(format!("{id}{PAYLOAD_SUFFIX}"));
            debug!(path = %path.display(), "Removing payload without metadata");
            remove_file_quietly(&path).await;
        }

        debug!(
            entries = index.records.len(),
            total_size = index.total_bytes,
            "Disk cache index rebuilt"
        );

        let cache = Self {
            cache_dir,
            budget,
            index: Mutex::new(index),
            files: RwLock::new(()),
            evictions: AtomicU64::new(0),
        };

        cache.cleanup_if_needed(None, now).await;

        Ok(cache)
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{id}{PAYLOAD_SUFFIX}"))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{id}{METADATA_SUFFIX}"))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{id}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4().simple()))
    }

    /// Reads an entry, marking it as accessed at `now`.
    ///
    /// A metadata record whose payload is missing, unreadable or truncated is
    /// treated as a miss and removed.
    pub async fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let files = self.files.read().await;
        let record = {
            let mut index = self.index.lock();
            let Some(record) = index.records.get_mut(key) else {
                trace!(key = %key, "Disk cache miss");
                return None;
            };
            record.last_accessed_at = now;
            record.clone()
        };

        let path = self.payload_path(&key.storage_id());
        let read = fs::read(&path).await;
        drop(files);

        match read {
            Ok(bytes) if bytes.len() as u64 == record.size_bytes => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                self.persist_access(&record).await;
                Some(record.into_entry(Bytes::from(bytes)))
            }
            Ok(bytes) => {
                warn!(
                    key = %key,
                    expected = record.size_bytes,
                    actual = bytes.len(),
                    "Cached payload size mismatch, dropping entry"
                );
                self.drop_orphan(&record).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached payload unreadable, dropping entry");
                self.drop_orphan(&record).await;
                None
            }
        }
    }

    /// Writes an entry (payload first, metadata last), then evicts until the
    /// disk total is back under budget.
    ///
    /// # Errors
    /// Returns `CacheError::BudgetTooSmall` if the entry alone exceeds the
    /// budget, or `CacheError::DiskWrite` if any file operation fails.
    pub async fn put(&self, entry: &CacheEntry, now: DateTime<Utc>) -> CacheResult<()> {
        if entry.size_bytes > self.budget {
            return Err(CacheError::BudgetTooSmall {
                tier: Tier::Disk,
                entry_size: entry.size_bytes,
                budget: self.budget,
            });
        }

        let mut record = EntryRecord::from_entry(entry);
        record.last_accessed_at = now;
        let id = entry.key.storage_id();

        let metadata = serde_json::to_vec_pretty(&record)
            .map_err(|e| CacheError::DiskWrite(format!("Failed to encode metadata: {e}")))?;

        let _files = self.files.write().await;

        self.write_atomically(&id, &self.payload_path(&id), &entry.payload)
            .await?;

        if let Err(e) = self
            .write_atomically(&id, &self.metadata_path(&id), &metadata)
            .await
        {
            // The payload may now disagree with an older metadata record.
            self.index.lock().take(&entry.key);
            self.delete_files(&id).await;
            return Err(e);
        }

        self.index.lock().insert(record);

        debug!(
            key = %entry.key,
            path = %self.payload_path(&id).display(),
            size = entry.size_bytes,
            "Stored entry in disk cache"
        );

        self.cleanup_if_needed(Some(&entry.key), now).await;

        Ok(())
    }

    /// Removes an entry, metadata first. Returns true if it was indexed.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let _files = self.files.write().await;
        let removed = self.index.lock().take(key).is_some();
        self.delete_files(&key.storage_id()).await;
        if removed {
            debug!(key = %key, "Removed entry from disk cache");
        }
        removed
    }

    /// Removes the key only if its record still describes this entry (same
    /// store time and size). Returns true if it was removed.
    pub async fn remove_matching(&self, entry: &CacheEntry) -> bool {
        let _files = self.files.write().await;
        let removed = {
            let mut index = self.index.lock();
            let matches = index.records.get(&entry.key).is_some_and(|record| {
                record.stored_at == entry.stored_at && record.size_bytes == entry.size_bytes
            });
            if matches {
                index.take(&entry.key);
            }
            matches
        };
        if removed {
            self.delete_files(&entry.key.storage_id()).await;
            debug!(key = %entry.key, "Withdrew entry from disk cache");
        }
        removed
    }

    /// Drops every entry whose freshness window has closed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let _files = self.files.write().await;
        let victims = self.index.lock().evict(0, None, now);
        let count = victims.len();
        self.delete_victims(victims).await;
        if count > 0 {
            debug!(count = count, "Purged expired entries from disk cache");
        }
        count
    }

    /// Clears the entire disk cache.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn clear(&self) -> CacheResult<()> {
        let _files = self.files.write().await;
        {
            let mut index = self.index.lock();
            index.records.clear();
            index.total_bytes = 0;
        }

        let mut entries = fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            let is_cache_file = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
                n.ends_with(PAYLOAD_SUFFIX) || n.ends_with(METADATA_SUFFIX) || n.ends_with(TEMP_SUFFIX)
            });
            if is_cache_file && fs::remove_file(&path).await.is_err() {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }
        debug!("Cleared disk cache");
        Ok(())
    }

    /// Returns true if the key is indexed.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().records.contains_key(key)
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().records.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks every file mutation until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn hold_file_reads(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.files.read().await
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns occupancy figures.
    #[must_use]
    pub fn usage(&self) -> TierUsage {
        let index = self.index.lock();
        TierUsage {
            entries: index.records.len(),
            bytes: index.total_bytes,
            budget: self.budget,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evicts entries if the disk total is over budget. Callers hold the
    /// file lock for writing, except `open`, which runs before any sharing.
    async fn cleanup_if_needed(&self, keep: Option<&CacheKey>, now: DateTime<Utc>) {
        let victims = {
            let mut index = self.index.lock();
            if index.total_bytes <= self.budget {
                return;
            }
            debug!(
                current_size = index.total_bytes,
                max_size = self.budget,
                "Disk cache over limit, cleaning up"
            );
            let over = index.total_bytes - self.budget;
            index.evict(over, keep, now)
        };
        self.delete_victims(victims).await;
    }

    async fn delete_victims(&self, victims: Vec<CacheKey>) {
        if victims.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        for victim in victims {
            self.delete_files(&victim.storage_id()).await;
            debug!(key = %victim, "Evicted entry from disk cache");
        }
    }

    async fn delete_files(&self, id: &str) {
        for path in [self.metadata_path(id), self.payload_path(id)] {
            if let Err(e) = fs::remove_file(&path).await
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }

    async fn drop_orphan(&self, seen: &EntryRecord) {
        let _files = self.files.write().await;
        let still_current = {
            let mut index = self.index.lock();
            if index
                .records
                .get(&seen.key)
                .is_some_and(|r| r.same_version(seen))
            {
                index.take(&seen.key);
                true
            } else {
                false
            }
        };
        if still_current {
            self.delete_files(&seen.key.storage_id()).await;
        }
    }

    /// Rewrites the metadata record with the indexed access time, as long as
    /// the index still holds the version that was just read.
    async fn persist_access(&self, seen: &EntryRecord) {
        let _files = self.files.write().await;
        let current = {
            let index = self.index.lock();
            match index.records.get(&seen.key) {
                Some(record) if record.same_version(seen) => record.clone(),
                _ => {
                    trace!(key = %seen.key, "Entry changed since read, access time not persisted");
                    return;
                }
            }
        };

        let Ok(metadata) = serde_json::to_vec_pretty(&current) else {
            return;
        };
        let id = seen.key.storage_id();
        if let Err(e) = self
            .write_atomically(&id, &self.metadata_path(&id), &metadata)
            .await
        {
            trace!(key = %seen.key, error = %e, "Failed to persist access time");
        }
    }

    /// Writes to a unique temp file and renames it over `target`.
    async fn write_atomically(&self, id: &str, target: &Path, bytes: &[u8]) -> CacheResult<()> {
        let tmp = self.temp_path(id);

        let result = async {
            let mut file = fs::File::create(&tmp)
                .await
                .map_err(|e| CacheError::DiskWrite(format!("Failed to create cache file: {e}")))?;
            file.write_all(bytes)
                .await
                .map_err(|e| CacheError::DiskWrite(format!("Failed to write cache file: {e}")))?;
            file.flush()
                .await
                .map_err(|e| CacheError::DiskWrite(format!("Failed to flush cache file: {e}")))?;
            drop(file);
            fs::rename(&tmp, target)
                .await
                .map_err(|e| CacheError::DiskWrite(format!("Failed to move cache file: {e}")))
        }
        .await;

        if result.is_err() {
            remove_file_quietly(&tmp).await;
        }
        result
    }
}

async fn load_record(path: &Path) -> Option<EntryRecord> {
    let bytes = fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn remove_file_quietly(path: &Path) {
    let _ = fs::remove_file(path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_url(&format!("https://example.com/{name}.png")).unwrap()
    }

    fn entry(name: &str, data: &[u8], now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(key(name), Bytes::copy_from_slice(data), now)
            .with_content_type(Some("image/png".to_string()))
            .with_validators(Some("\"v1\"".to_string()), None)
    }

    async fn create_test_cache(budget: u64) -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::open(temp_dir.path().to_path_buf(), budget, t(0))
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        let stored = entry("test1", b"test image data", t(0));

        cache.put(&stored, t(0)).await.unwrap();
        let retrieved = cache.get(&key("test1"), t(0)).await.unwrap();

        assert_eq!(retrieved, stored);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        assert!(cache.get(&key("nonexistent"), t(0)).await.is_none());
    }

    #[tokio::test]
    async fn test_files_are_laid_out_per_key() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        cache.put(&entry("test1", b"abc", t(0)), t(0)).await.unwrap();

        let id = key("test1").storage_id();
        assert!(temp.path().join(format!("{id}.img")).exists());
        let meta = std::fs::read_to_string(temp.path().join(format!("{id}.meta.json"))).unwrap();
        assert!(meta.contains("\"contentType\""));
        assert!(meta.contains("\"sizeBytes\": 3"));
        assert!(meta.contains("\"lastAccessedAt\""));
    }

    #[tokio::test]
    async fn test_missing_payload_self_heals() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        cache.put(&entry("test1", b"abc", t(0)), t(0)).await.unwrap();

        let id = key("test1").storage_id();
        std::fs::remove_file(temp.path().join(format!("{id}.img"))).unwrap();

        assert!(cache.get(&key("test1"), t(1)).await.is_none());
        assert!(!cache.contains(&key("test1")));
        assert!(!temp.path().join(format!("{id}.meta.json")).exists());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        cache.put(&entry("test1", b"test", t(0)), t(0)).await.unwrap();
        assert!(cache.contains(&key("test1")));

        assert!(cache.remove(&key("test1")).await);
        assert!(!cache.contains(&key("test1")));
        assert!(!cache.remove(&key("test1")).await);

        let id = key("test1").storage_id();
        assert!(!temp.path().join(format!("{id}.img")).exists());
        assert!(!temp.path().join(format!("{id}.meta.json")).exists());
    }

    #[tokio::test]
    async fn test_counters_follow_writes() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;

        cache.put(&entry("test1", b"hello", t(0)), t(0)).await.unwrap();
        cache.put(&entry("test2", b"world!", t(0)), t(0)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 11);

        cache.put(&entry("test1", b"hey", t(1)), t(1)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 9);

        cache.remove(&key("test2")).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 3);

        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_total_under_budget() {
        let (cache, _temp) = create_test_cache(10).await;

        cache.put(&entry("test1", b"123456", t(0)), t(0)).await.unwrap();
        cache.put(&entry("test2", b"123456", t(1)), t(1)).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 6);
        assert!(cache.contains(&key("test2")));
        assert_eq!(cache.usage().evictions, 1);
    }

    #[tokio::test]
    async fn test_disk_reads_update_recency() {
        let (cache, _temp) = create_test_cache(12).await;

        cache.put(&entry("a", b"1234", t(0)), t(0)).await.unwrap();
        cache.put(&entry("b", b"1234", t(1)), t(1)).await.unwrap();
        cache.put(&entry("c", b"1234", t(2)), t(2)).await.unwrap();
        assert!(cache.get(&key("a"), t(3)).await.is_some());

        cache.put(&entry("d", b"1234", t(4)), t(4)).await.unwrap();
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
    }

    #[tokio::test]
    async fn test_entry_larger_than_budget_is_rejected() {
        let (cache, _temp) = create_test_cache(4).await;
        let err = cache.put(&entry("big", b"12345", t(0)), t(0)).await.unwrap_err();
        assert!(matches!(err, CacheError::BudgetTooSmall { tier: Tier::Disk, .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (cache, temp) = create_test_cache(1024).await;
        let dir = temp.path().to_path_buf();
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"not a directory").unwrap();

        let err = cache.put(&entry("test1", b"abc", t(0)), t(0)).await.unwrap_err();
        assert!(matches!(err, CacheError::DiskWrite(_)));
        assert!(!cache.contains(&key("test1")));

        std::fs::remove_file(&dir).unwrap();
        std::fs::create_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (cache, _temp) = create_test_cache(1024).await;
        cache
            .put(&entry("short", b"abc", t(0)).with_expiry(Some(t(5))), t(0))
            .await
            .unwrap();
        cache.put(&entry("long", b"abc", t(0)), t(0)).await.unwrap();

        assert_eq!(cache.purge_expired(t(5)).await, 1);
        assert!(!cache.contains(&key("short")));
        assert!(cache.contains(&key("long")));
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_and_cleans_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        {
            let cache = DiskImageCache::open(dir.clone(), 1024, t(0)).await.unwrap();
            cache.put(&entry("kept", b"keep me", t(0)), t(0)).await.unwrap();
            cache.put(&entry("orphan", b"lost", t(0)), t(0)).await.unwrap();
        }

        let orphan_id = key("orphan").storage_id();
        std::fs::remove_file(dir.join(format!("{orphan_id}.img"))).unwrap();
        std::fs::write(dir.join("stray.img"), b"no metadata").unwrap();
        std::fs::write(dir.join("abc.123.tmp"), b"half written").unwrap();

        let cache = DiskImageCache::open(dir.clone(), 1024, t(1)).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 7);
        let kept = cache.get(&key("kept"), t(1)).await.unwrap();
        assert_eq!(&kept.payload[..], b"keep me");
        assert_eq!(kept.etag.as_deref(), Some("\"v1\""));

        assert!(!dir.join(format!("{orphan_id}.meta.json")).exists());
        assert!(!dir.join("stray.img").exists());
        assert!(!dir.join("abc.123.tmp").exists());
    }

    #[tokio::test]
    async fn test_reopen_enforces_smaller_budget() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        {
            let cache = DiskImageCache::open(dir.clone(), 1024, t(0)).await.unwrap();
            cache.put(&entry("old", b"12345", t(0)), t(0)).await.unwrap();
            cache.put(&entry("new", b"12345", t(1)), t(1)).await.unwrap();
        }

        let cache = DiskImageCache::open(dir, 6, t(2)).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("new")));
    }

    #[tokio::test]
    async fn test_access_time_not_persisted_for_removed_entry() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        let stored = entry("test1", b"abc", t(0));
        cache.put(&stored, t(0)).await.unwrap();
        let seen = EntryRecord::from_entry(&stored);

        cache.remove(&key("test1")).await;
        cache.persist_access(&seen).await;

        let id = key("test1").storage_id();
        assert!(!temp.path().join(format!("{id}.meta.json")).exists());
    }

    #[tokio::test]
    async fn test_access_time_not_persisted_over_newer_record() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        let old = entry("test1", b"abc", t(0));
        cache.put(&old, t(0)).await.unwrap();
        let seen = EntryRecord::from_entry(&old);

        cache.put(&entry("test1", b"abcdef", t(5)), t(5)).await.unwrap();
        cache.persist_access(&seen).await;

        let id = key("test1").storage_id();
        let record = load_record(&temp.path().join(format!("{id}.meta.json")))
            .await
            .unwrap();
        assert_eq!(record.size_bytes, 6);
        assert_eq!(record.stored_at, t(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_racing_removal_leave_no_orphan_metadata() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        let cache = std::sync::Arc::new(cache);
        let id = key("race").storage_id();
        let metadata_path = temp.path().join(format!("{id}.meta.json"));
        let payload_path = temp.path().join(format!("{id}.img"));

        for round in 0..100 {
            cache.put(&entry("race", b"payload", t(round)), t(round)).await.unwrap();

            let reader = {
                let cache = std::sync::Arc::clone(&cache);
                tokio::spawn(async move { cache.get(&key("race"), t(round)).await })
            };
            let remover = {
                let cache = std::sync::Arc::clone(&cache);
                tokio::spawn(async move { cache.remove(&key("race")).await })
            };
            reader.await.unwrap();
            remover.await.unwrap();

            assert!(!metadata_path.exists(), "metadata left behind in round {round}");
            assert!(!payload_path.exists());
            assert!(!cache.contains(&key("race")));
        }
    }

    #[tokio::test]
    async fn test_remove_matching_keeps_newer_record() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        let old = entry("test1", b"abc", t(0));
        cache.put(&old, t(0)).await.unwrap();
        let newer = entry("test1", b"abcd", t(1));
        cache.put(&newer, t(1)).await.unwrap();

        assert!(!cache.remove_matching(&old).await);
        assert!(cache.contains(&key("test1")));
        assert!(cache.remove_matching(&newer).await);
        assert!(cache.is_empty());
    }
}
