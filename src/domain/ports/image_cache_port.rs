//! Port definition for image caching.

use crate::domain::entities::{CacheEntry, ResponseMetadata};

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache tier that produced an error or a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// In-memory tier.
    Memory,
    /// On-disk tier.
    Disk,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// URL could not be turned into a cache key.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// I/O error while writing an entry to disk.
    #[error("Disk write error: {0}")]
    DiskWrite(String),
    /// I/O error while reading an entry from disk.
    #[error("Disk read error: {0}")]
    DiskRead(String),
    /// A single entry does not fit in a tier even when it is empty.
    #[error("{tier} budget of {budget} bytes cannot hold an entry of {entry_size} bytes")]
    BudgetTooSmall {
        /// Tier whose budget is too small.
        tier: Tier,
        /// Size of the rejected entry.
        entry_size: u64,
        /// Configured budget of the tier.
        budget: u64,
    },
    /// I/O error outside of entry reads and writes (directory setup, scans).
    #[error("IO error: {0}")]
    IoError(String),
    /// Network error raised by the HTTP collaborator.
    #[error("Network error: {0}")]
    NetworkError(String),
}

impl CacheError {
    /// Returns true for configuration defects that retrying cannot fix.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::BudgetTooSmall { .. })
    }
}

/// What a `store` call did with the payload it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Written through both tiers.
    Stored,
    /// Written to memory, disk write failed.
    MemoryOnly {
        /// The disk failure that was absorbed.
        disk_error: CacheError,
    },
    /// Response forbids storage; any previous entry for the key was removed.
    NotStored,
    /// Another population for the key was active, payload discarded.
    Deduplicated,
}

impl StoreOutcome {
    /// Returns true when the entry is now servable from at least one tier.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Stored | Self::MemoryOnly { .. })
    }
}

/// Port for image caching operations.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Looks up a fresh entry for the URL. Never fails; any problem is a miss.
    async fn lookup(&self, url: &str) -> Option<CacheEntry>;

    /// Stores a fetched payload according to its response metadata.
    async fn store(
        &self,
        url: &str,
        payload: bytes::Bytes,
        metadata: &ResponseMetadata,
    ) -> CacheResult<StoreOutcome>;

    /// Removes the URL from every tier regardless of freshness.
    async fn invalidate(&self, url: &str);
}
