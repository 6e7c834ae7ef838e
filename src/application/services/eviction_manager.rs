//! Victim selection shared by the memory and disk tiers.

use chrono::{DateTime, Utc};

use crate::domain::entities::{CacheEntry, CacheKey};

/// What eviction needs to know about a resident entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Entry key.
    pub key: CacheKey,
    /// Bytes the entry occupies.
    pub size_bytes: u64,
    /// Last read or write.
    pub last_accessed_at: DateTime<Utc>,
    /// Freshness deadline, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

impl EvictionCandidate {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

impl From<&CacheEntry> for EvictionCandidate {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            last_accessed_at: entry.last_accessed_at,
            expires_at: entry.expires_at,
        }
    }
}

/// Ordered victims plus whether they free what was asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Keys to remove, in removal order.
    pub victims: Vec<CacheKey>,
    /// Total size of the victims.
    pub bytes_freed: u64,
    /// False when even evicting everything frees less than requested.
    pub satisfied: bool,
}

impl EvictionPlan {
    /// Returns true if nothing needs to be removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Expired-first, then least-recently-used eviction policy.
pub struct EvictionManager;

impl EvictionManager {
    /// Picks victims from a tier snapshot to free at least `bytes_to_free`.
    ///
    /// Every expired entry is selected first regardless of the target. The
    /// remainder is taken in `last_accessed_at` order, larger entries first on
    /// ties, until the target is met. With a target of zero only expired
    /// entries are returned.
    #[must_use]
    pub fn select_victims(
        snapshot: &[EvictionCandidate],
        bytes_to_free: u64,
        now: DateTime<Utc>,
    ) -> EvictionPlan {
        let (mut expired, mut live): (Vec<&EvictionCandidate>, Vec<&EvictionCandidate>) =
            snapshot.iter().partition(|c| c.is_expired(now));

        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.key.cmp(&b.key)));
        live.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| b.size_bytes.cmp(&a.size_bytes))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut plan = EvictionPlan::default();
        for candidate in expired {
            plan.bytes_freed += candidate.size_bytes;
            plan.victims.push(candidate.key.clone());
        }

        for candidate in live {
            if plan.bytes_freed >= bytes_to_free {
                break;
            }
            plan.bytes_freed += candidate.size_bytes;
            plan.victims.push(candidate.key.clone());
        }

        plan.satisfied = plan.bytes_freed >= bytes_to_free;
        plan
    }
}
