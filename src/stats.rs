//! Counters for cache-aside performance monitoring

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of coordinator activity
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the cache
    pub hits: u64,

    /// Reads that found no entry
    pub misses: u64,

    /// Reads that found an expired entry
    pub stale: u64,

    /// Reads that found an entry that failed to decode
    pub corrupt: u64,

    /// Calls into the persistent store
    pub recomputations: u64,

    /// Persistent-store failures surfaced to callers
    pub recompute_failures: u64,

    /// Cache-store operations that failed and were downgraded
    pub cache_errors: u64,

    /// Missing reads then served by a leader's write (a subset of the above)
    pub follower_hits: u64,

    /// Followers that gave up waiting and recomputed themselves
    pub follower_timeouts: u64,

    /// Explicit invalidations that removed an entry
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    ///
    /// Every read lands in exactly one of `hits`, `misses`, `stale` or
    /// `corrupt`; `follower_hits` are misses that a leader's write then served.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.follower_hits;
        let total = self.hits + self.misses + self.stale + self.corrupt;
        if total == 0 {
            0.0
        } else {
            (served as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, stale: {}, corrupt: {}, hit_rate: {:.2}%, recomputations: {}, cache_errors: {} }}",
            self.hits,
            self.misses,
            self.stale,
            self.corrupt,
            self.hit_rate(),
            self.recomputations,
            self.cache_errors
        )
    }
}

/// Lock-free counters shared by concurrent callers
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale: AtomicU64,
    pub corrupt: AtomicU64,
    pub recomputations: AtomicU64,
    pub recompute_failures: AtomicU64,
    pub cache_errors: AtomicU64,
    pub follower_hits: AtomicU64,
    pub follower_timeouts: AtomicU64,
    pub invalidations: AtomicU64,
}

impl StatsRecorder {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
            recompute_failures: self.recompute_failures.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            follower_hits: self.follower_hits.load(Ordering::Relaxed),
            follower_timeouts: self.follower_timeouts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
