//! Image caching infrastructure.
//!
//! This module provides:
//! - Memory caching with byte-budgeted LRU eviction
//! - Disk caching for persistence across restarts
//! - The two-tier coordinator with single-flight population
//! - Async image loading on top of a fetch port

pub mod coordinator;
pub mod disk_cache;
pub mod in_flight;
pub mod loader;
pub mod memory_cache;
pub mod stats;

pub use coordinator::{FetchGuard, FetchTicket, ImageCache, ImageCacheConfig};
pub use disk_cache::{DEFAULT_DISK_BUDGET, DiskImageCache};
pub use in_flight::{FetchWaiter, InFlightRegistry, Population};
pub use loader::{DEFAULT_MAX_CONCURRENT_DOWNLOADS, ImageLoader};
pub use memory_cache::{DEFAULT_MEMORY_BUDGET, MemoryImageCache};
pub use stats::{CacheStats, TierUsage};
