//! Time-to-live selection and staleness checks

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Smallest TTL jitter is allowed to produce
const MIN_TTL: Duration = Duration::from_millis(1);

/// Supplies TTLs per query kind
///
/// The default policy applies one global duration to every kind. Per-kind
/// overrides and jitter are opt-in.
#[derive(Debug, Clone)]
pub struct ExpiryPolicy {
    default_ttl: Duration,
    overrides: HashMap<String, Duration>,
    ttl_jitter: f64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3600))
    }
}

impl ExpiryPolicy {
    /// A single TTL for every query kind
    pub fn fixed(ttl: Duration) -> Self {
        Self {
            default_ttl: ttl,
            overrides: HashMap::new(),
            ttl_jitter: 0.0,
        }
    }

    /// Override the TTL for one query kind
    pub fn with_ttl_for(mut self, query_kind: impl Into<String>, ttl: Duration) -> Self {
        self.overrides.insert(query_kind.into(), ttl);
        self
    }

    /// Spread TTLs by up to `jitter` (0.0 - 1.0) of their base value
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// TTL to store a freshly computed result of `query_kind` with
    pub fn ttl_for(&self, query_kind: &str) -> Duration {
        let base = self
            .overrides
            .get(query_kind)
            .copied()
            .unwrap_or(self.default_ttl);

        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;

        Duration::try_from_secs_f64((base_secs + jitter).max(0.0))
            .unwrap_or(base)
            .max(MIN_TTL)
    }

    /// Whether an entry stored at `stored_at` with `ttl` has expired at `now`
    ///
    /// An entry is fresh strictly before `stored_at + ttl`. A `stored_at` in
    /// the future (clock skew between writers) counts as just stored.
    pub fn is_stale(stored_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = (now - stored_at).to_std().unwrap_or(Duration::ZERO);
        elapsed >= ttl
    }
}
