//! Cache statistics.

/// Occupancy of a single tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierUsage {
    /// Number of resident entries.
    pub entries: usize,
    /// Bytes currently held.
    pub bytes: u64,
    /// Configured byte budget.
    pub budget: u64,
    /// Entries evicted since startup.
    pub evictions: u64,
}

impl std::fmt::Display for TierUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entries, {}/{} bytes, {} evicted",
            self.entries, self.bytes, self.budget, self.evictions
        )
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub memory_hits: u64,
    /// Lookups served from disk.
    pub disk_hits: u64,
    /// Lookups that found nothing fresh.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Successful write-throughs.
    pub stores: u64,
    /// Populations currently registered.
    pub in_flight: usize,
    /// Memory tier occupancy.
    pub memory: TierUsage,
    /// Disk tier occupancy.
    pub disk: TierUsage,
}

impl CacheStats {
    /// Computes the hit rate from raw counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(memory_hits: u64, disk_hits: u64, misses: u64) -> f64 {
        let hits = memory_hits + disk_hits;
        let total = hits + misses;
        if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Cache: {:.1}% hit rate ({} memory hits, {} disk hits, {} misses), {} stores, {} in flight",
            self.hit_rate, self.memory_hits, self.disk_hits, self.misses, self.stores, self.in_flight
        )?;
        writeln!(f, "  memory: {}", self.memory)?;
        write!(f, "  disk:   {}", self.disk)
    }
}
