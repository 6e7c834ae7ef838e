//! Application layer with the cache policies.

/// Freshness and eviction policies.
pub mod services;

pub use services::{EvictionManager, FreshnessEvaluator, StorePolicy};
