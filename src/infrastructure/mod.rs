//! Infrastructure layer with cache tiers and external service adapters.

/// Application configuration.
pub mod config;
/// HTTP image downloads.
pub mod http;
/// Image caching (tiers, coordination, loading).
pub mod image;

pub use config::{CacheConfig, CliArgs, Command, ConfigError, LogLevel};
pub use http::ImageFetcher;
pub use image::{
    CacheStats, DiskImageCache, FetchGuard, FetchTicket, FetchWaiter, ImageCache,
    ImageCacheConfig, ImageLoader, MemoryImageCache, Population, TierUsage,
};
