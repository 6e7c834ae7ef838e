//! Domain layer with cache entities and port definitions.

/// Entity definitions.
pub mod entities;
/// Port definitions.
pub mod ports;

pub use entities::{CacheEntry, CacheKey, ImageSource, LoadedImage, ResponseMetadata};
pub use ports::{
    CacheError, CacheResult, Clock, FetchedImage, ImageCachePort, ImageFetchPort, StoreOutcome,
    SystemClock, Tier,
};
