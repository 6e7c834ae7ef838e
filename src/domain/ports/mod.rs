mod clock_port;
mod image_cache_port;
mod image_fetch_port;

pub use clock_port::{Clock, SystemClock};
pub use image_cache_port::{CacheError, CacheResult, ImageCachePort, StoreOutcome, Tier};
pub use image_fetch_port::{FetchedImage, ImageFetchPort};
