//! In-memory, byte-budgeted image cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::application::services::{EvictionCandidate, EvictionManager};
use crate::domain::entities::{CacheEntry, CacheKey};
use crate::domain::ports::{CacheError, CacheResult, Tier};

use super::stats::TierUsage;

/// Default memory budget in bytes (100 MB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 100 * 1024 * 1024;

#[derive(Default)]
struct MemoryState {
    entries: HashMap<CacheKey, CacheEntry>,
    resident_bytes: u64,
    generation: u64,
}

impl MemoryState {
    fn take(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.resident_bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// In-memory cache of payload-resident entries.
///
/// The index and the resident byte total sit behind one lock that is never
/// held across I/O.
pub struct MemoryImageCache {
    state: Mutex<MemoryState>,
    budget: u64,
    evictions: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the given byte budget.
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            budget,
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a new cache with the default budget.
    #[must_use]
    pub fn with_default_budget() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET)
    }

    /// Returns the entry and marks it as accessed at `now`.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed_at = now;
            trace!(key = %key, "Memory cache hit");
            Some(entry.clone())
        } else {
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Returns the entry without touching its recency.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Inserts or replaces an entry, then evicts until back under budget.
    ///
    /// Entries that expired before `now` are refused.
    ///
    /// # Errors
    /// Returns `CacheError::BudgetTooSmall` if the entry alone exceeds the budget.
    pub fn put(&self, entry: CacheEntry, now: DateTime<Utc>) -> CacheResult<()> {
        if !self.admissible(&entry, now)? {
            return Ok(());
        }

        let key = entry.key.clone();
        let size = entry.size_bytes;
        let evicted = {
            let mut state = self.state.lock();
            state.generation += 1;
            self.insert_locked(&mut state, entry, now)
        };

        debug!(key = %key, size = size, "Stored entry in memory cache");
        self.record_evictions(&evicted);
        Ok(())
    }

    /// Current write generation. Every `put`, `remove` and `clear` advances it.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Inserts an entry copied out of the disk tier.
    ///
    /// Nothing is inserted if the tier was written or cleared since
    /// `seen_generation` was read, or if memory already holds a copy stored at
    /// the same time or later. Returns true if the entry was inserted.
    ///
    /// # Errors
    /// Returns `CacheError::BudgetTooSmall` if the entry alone exceeds the budget.
    pub fn promote(
        &self,
        entry: CacheEntry,
        seen_generation: u64,
        now: DateTime<Utc>,
    ) -> CacheResult<bool> {
        if !self.admissible(&entry, now)? {
            return Ok(false);
        }

        let key = entry.key.clone();
        let evicted = {
            let mut state = self.state.lock();
            if state.generation != seen_generation {
                trace!(key = %key, "Memory tier changed during disk read, not promoting");
                return Ok(false);
            }
            if state
                .entries
                .get(&key)
                .is_some_and(|current| current.stored_at >= entry.stored_at)
            {
                trace!(key = %key, "Memory already holds a copy as new, not promoting");
                return Ok(false);
            }
            self.insert_locked(&mut state, entry, now)
        };

        debug!(key = %key, "Promoted entry into memory cache");
        self.record_evictions(&evicted);
        Ok(true)
    }

    /// Removes an entry. Returns true if it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.take(key).is_some()
        };
        if removed {
            debug!(key = %key, "Removed entry from memory cache");
        }
        removed
    }

    /// Removes the key only if it still holds this exact entry (same store
    /// time and payload buffer). Returns true if it was removed.
    pub fn remove_matching(&self, entry: &CacheEntry) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let matches = state.entries.get(&entry.key).is_some_and(|current| {
                current.stored_at == entry.stored_at
                    && current.payload.as_ptr() == entry.payload.as_ptr()
                    && current.size_bytes == entry.size_bytes
            });
            if matches {
                state.generation += 1;
                state.take(&entry.key);
            }
            matches
        };
        if removed {
            debug!(key = %entry.key, "Withdrew entry from memory cache");
        }
        removed
    }

    fn admissible(&self, entry: &CacheEntry, now: DateTime<Utc>) -> CacheResult<bool> {
        if entry.expires_at.is_some_and(|expires| expires < now) {
            warn!(key = %entry.key, "Refusing to cache an already expired entry in memory");
            return Ok(false);
        }

        if entry.size_bytes > self.budget {
            return Err(CacheError::BudgetTooSmall {
                tier: Tier::Memory,
                entry_size: entry.size_bytes,
                budget: self.budget,
            });
        }

        Ok(true)
    }

    /// Inserts, then evicts other entries until the total fits the budget.
    fn insert_locked(
        &self,
        state: &mut MemoryState,
        mut entry: CacheEntry,
        now: DateTime<Utc>,
    ) -> Vec<CacheKey> {
        entry.last_accessed_at = now;
        let key = entry.key.clone();
        let size = entry.size_bytes;

        state.take(&key);
        state.entries.insert(key.clone(), entry);
        state.resident_bytes += size;

        if state.resident_bytes <= self.budget {
            return Vec::new();
        }

        let over = state.resident_bytes - self.budget;
        let snapshot: Vec<EvictionCandidate> = state
            .entries
            .values()
            .filter(|e| e.key != key)
            .map(EvictionCandidate::from)
            .collect();
        let plan = EvictionManager::select_victims(&snapshot, over, now);
        if !plan.satisfied {
            warn!(
                key = %key,
                needed = over,
                freed = plan.bytes_freed,
                "Memory eviction could not free enough space"
            );
        }
        for victim in &plan.victims {
            state.take(victim);
        }
        plan.victims
    }

    fn record_evictions(&self, evicted: &[CacheKey]) {
        if evicted.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for victim in evicted {
            debug!(key = %victim, "Evicted entry from memory cache");
        }
    }

    /// Drops every entry whose freshness window has closed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let purged = {
            let mut state = self.state.lock();
            let snapshot: Vec<EvictionCandidate> =
                state.entries.values().map(EvictionCandidate::from).collect();
            let plan = EvictionManager::select_victims(&snapshot, 0, now);
            for victim in &plan.victims {
                state.take(victim);
            }
            plan.victims.len()
        };

        if purged > 0 {
            self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
            debug!(count = purged, "Purged expired entries from memory cache");
        }
        purged
    }

    /// Clears all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.resident_bytes = 0;
        state.generation += 1;
        debug!("Cleared memory image cache");
    }

    /// Returns the current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bytes currently resident.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    /// Returns the configured budget.
    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    /// Returns occupancy figures.
    #[must_use]
    pub fn usage(&self) -> TierUsage {
        let state = self.state.lock();
        TierUsage {
            entries: state.entries.len(),
            bytes: state.resident_bytes,
            budget: self.budget,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_default_budget()
    }
}
