//! pixcache - A two-tier HTTP image cache.
//!
//! This crate keeps downloaded image payloads in a byte-budgeted memory tier
//! backed by a persistent disk tier, honoring HTTP freshness headers and
//! collapsing concurrent populations of the same URL into one.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the freshness and eviction policies.
pub mod application;
/// Domain layer containing entities and port definitions.
pub mod domain;
/// Infrastructure layer containing cache tiers and adapters.
pub mod infrastructure;

pub use domain::{CacheEntry, CacheError, CacheKey, CacheResult, ResponseMetadata, StoreOutcome};
pub use infrastructure::{ImageCache, ImageCacheConfig};

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "pixcache";
