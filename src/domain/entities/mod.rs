//! Domain entity definitions.

mod cache_entry;
mod cache_key;
mod loaded_image;
mod response_metadata;

pub use cache_entry::CacheEntry;
pub use cache_key::CacheKey;
pub use loaded_image::{ImageSource, LoadedImage};
pub use response_metadata::ResponseMetadata;
