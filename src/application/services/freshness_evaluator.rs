//! Decides whether a response may be cached and for how long.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use crate::domain::entities::ResponseMetadata;

/// Status codes whose payload is cacheable by default.
const CACHEABLE_STATUS: [u16; 2] = [200, 203];

/// Storage decision for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Must not be stored; any existing entry must go.
    DoNotStore,
    /// Store, fresh until the given instant (exclusive).
    StoreWithExpiry(DateTime<Utc>),
    /// Store, fresh until evicted or invalidated.
    StoreNoExpiry,
}

impl StorePolicy {
    /// Expiry to record on the entry, if the policy stores at all.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::StoreWithExpiry(at) => Some(*at),
            Self::DoNotStore | Self::StoreNoExpiry => None,
        }
    }
}

/// Parsed `Cache-Control` directives that matter to a private image cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store`
    pub no_store: bool,
    /// `no-cache`
    pub no_cache: bool,
    /// `private`
    pub private: bool,
    /// First well-formed `max-age`, in seconds.
    pub max_age: Option<i64>,
}

impl CacheControl {
    /// Parses a `Cache-Control` header value. Malformed directives are skipped.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }

            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "private" => directives.private = true,
                "max-age" => match arg.and_then(|a| a.parse::<i64>().ok()) {
                    Some(secs) if secs >= 0 => {
                        if directives.max_age.is_none() {
                            directives.max_age = Some(secs);
                        }
                    }
                    _ => warn!(directive = directive, "Ignoring malformed max-age directive"),
                },
                _ => {}
            }
        }

        directives
    }
}

/// Pure HTTP freshness rules over response metadata.
pub struct FreshnessEvaluator;

impl FreshnessEvaluator {
    /// Evaluates a response against the storage precedence rules:
    /// status, then `no-store`, then `no-cache`, then `max-age`, then `Expires`.
    #[must_use]
    pub fn evaluate(metadata: &ResponseMetadata, now: DateTime<Utc>) -> StorePolicy {
        if !CACHEABLE_STATUS.contains(&metadata.status()) {
            return StorePolicy::DoNotStore;
        }

        let directives = metadata
            .header("cache-control")
            .map(CacheControl::parse)
            .unwrap_or_default();

        if directives.no_store {
            return StorePolicy::DoNotStore;
        }

        // Stored but stale on arrival: every reuse needs revalidation.
        if directives.no_cache {
            return StorePolicy::StoreWithExpiry(now);
        }

        if let Some(secs) = directives.max_age {
            return TimeDelta::try_seconds(secs)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .map_or(StorePolicy::StoreNoExpiry, StorePolicy::StoreWithExpiry);
        }

        if let Some(expires) = metadata.header("expires").and_then(parse_expires) {
            return StorePolicy::StoreWithExpiry(expires);
        }

        StorePolicy::StoreNoExpiry
    }
}

fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    match httpdate::parse_http_date(value.trim()) {
        Ok(time) => Some(DateTime::<Utc>::from(time)),
        Err(e) => {
            warn!(value = value, error = %e, "Ignoring malformed Expires header");
            None
        }
    }
}
