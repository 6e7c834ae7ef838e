//! HTTP client used to populate the cache.

pub mod image_fetcher;

pub use image_fetcher::{ImageFetcher, metadata_from_response};
