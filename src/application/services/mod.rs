pub mod eviction_manager;
pub mod freshness_evaluator;

pub use eviction_manager::{EvictionCandidate, EvictionManager, EvictionPlan};
pub use freshness_evaluator::{CacheControl, FreshnessEvaluator, StorePolicy};
