//! Cache-aside coordination
//!
//! [`CacheAsideCoordinator::get`] answers from the cache when it can and
//! otherwise recomputes through a caller-supplied function, with at most one
//! recomputation per key in flight. The cache store is best-effort: any
//! failure to read it is a miss and any failure to write it is logged and
//! ignored. Persistent-store failures reach the caller that led the
//! recomputation.

use crate::codec::{CachedValue, JsonCodec, QueryValue, SerializationCodec};
use crate::config::CacheAsideConfig;
use crate::error::{CacheError, CacheStoreError, Result, StoreError};
use crate::expiry::ExpiryPolicy;
use crate::key::{CacheKey, QueryParams};
use crate::stampede::{Acquired, FollowerWait, LeaderGuard, StampedeGuard, StampedePolicy, WaitOutcome};
use crate::stats::{CacheStats, StatsRecorder};
use crate::store::{CacheStore, InMemoryCacheStore, PersistentStore, RedisCacheStore};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the cache holds for a key
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A fresh, decodable entry
    Hit(CachedValue),
    /// No entry
    Miss,
    /// An entry whose TTL has elapsed (stores without native expiry only)
    Stale,
    /// An entry that failed to decode
    Corrupt(String),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Read-through cache in front of an aggregate query executor
///
/// ```no_run
/// use aggregate_cache::{CacheAsideConfig, CacheAsideCoordinator, QueryParams, QueryValue};
///
/// # async fn example() -> anyhow::Result<()> {
/// let coordinator = CacheAsideCoordinator::from_config(CacheAsideConfig::default()).await?;
///
/// let counts = coordinator
///     .get("count_by_director", &QueryParams::new(), || async {
///         Ok(QueryValue::rows(vec![(27, "Christopher Nolan"), (14, "Denis Villeneuve")]))
///     })
///     .await?;
/// println!("{:?}", counts);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheAsideCoordinator {
    cache: Arc<dyn CacheStore>,
    codec: Arc<dyn SerializationCodec>,
    expiry: ExpiryPolicy,
    guard: StampedeGuard,
    policy: StampedePolicy,
    key_prefix: String,
    cache_timeout: Duration,
    stats: Arc<StatsRecorder>,
}

impl CacheAsideCoordinator {
    /// Create a coordinator over `cache`
    pub fn new(cache: Arc<dyn CacheStore>, config: &CacheAsideConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Initializing cache-aside coordinator (store: {}, default_ttl: {:?}, follower_timeout: {:?})",
            cache.name(),
            config.default_ttl,
            config.follower_timeout
        );

        Ok(Self {
            cache,
            codec: Arc::new(JsonCodec),
            expiry: config.expiry_policy(),
            guard: StampedeGuard::new(),
            policy: config.stampede_policy(),
            key_prefix: config.key_prefix.clone(),
            cache_timeout: config.cache_operation_timeout,
            stats: Arc::new(StatsRecorder::default()),
        })
    }

    /// Create a coordinator over Redis when `redis_url` is set, in-memory otherwise
    pub async fn from_config(config: CacheAsideConfig) -> Result<Self> {
        config.validate()?;

        let cache: Arc<dyn CacheStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisCacheStore::connect(url, config.cache_operation_timeout).await?),
            None => Arc::new(InMemoryCacheStore::default()),
        };

        Self::new(cache, &config)
    }

    /// Replace the codec used for cache entries
    pub fn with_codec(mut self, codec: Arc<dyn SerializationCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Derive the cache key of a query
    pub fn key_for(&self, query_kind: &str, params: &QueryParams) -> Result<CacheKey> {
        CacheKey::derive(&self.key_prefix, query_kind, params)
    }

    /// Return the cached result of a query, recomputing it on a miss
    pub async fn get<F, Fut>(
        &self,
        query_kind: &str,
        params: &QueryParams,
        recompute: F,
    ) -> Result<QueryValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<QueryValue, StoreError>>,
    {
        let key = self.key_for(query_kind, params)?;

        let lookup = self.read(&key).await;
        self.record(&lookup);
        if let CacheLookup::Hit(cached) = lookup {
            debug!("Cache hit: {}", key);
            return Ok(cached.value);
        }

        match self.guard.acquire(&key) {
            Acquired::Leader(leader) => self.lead(leader, query_kind, true, recompute).await,
            Acquired::Follower(wait) => self.follow(wait, query_kind, recompute).await,
        }
    }

    /// Read-through over a [`PersistentStore`]
    pub async fn get_aggregate<S>(
        &self,
        store: &S,
        query_kind: &str,
        params: &QueryParams,
    ) -> Result<QueryValue>
    where
        S: PersistentStore + ?Sized,
    {
        self.get(query_kind, params, || {
            store.execute_aggregate_query(query_kind, params)
        })
        .await
    }

    /// Recompute and overwrite the entry whatever the cache holds
    ///
    /// A refresh already in flight for the same key is joined rather than repeated.
    pub async fn refresh<F, Fut>(
        &self,
        query_kind: &str,
        params: &QueryParams,
        recompute: F,
    ) -> Result<QueryValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<QueryValue, StoreError>>,
    {
        let key = self.key_for(query_kind, params)?;

        match self.guard.acquire(&key) {
            Acquired::Leader(leader) => self.lead(leader, query_kind, false, recompute).await,
            Acquired::Follower(wait) => self.follow(wait, query_kind, recompute).await,
        }
    }

    /// Inspect the cache entry of a query without recomputing
    pub async fn lookup(&self, query_kind: &str, params: &QueryParams) -> Result<CacheLookup> {
        let key = self.key_for(query_kind, params)?;
        match self.bounded("GET", self.cache.get(key.as_str())).await? {
            None => Ok(CacheLookup::Miss),
            Some(bytes) => Ok(self.classify(&key, &bytes)),
        }
    }

    /// Remove the cache entry of a query; returns whether one existed
    pub async fn invalidate(&self, query_kind: &str, params: &QueryParams) -> Result<bool> {
        let key = self.key_for(query_kind, params)?;
        let removed = self.bounded("DELETE", self.cache.delete(key.as_str())).await?;

        if removed {
            StatsRecorder::incr(&self.stats.invalidations);
            info!("Invalidated cache entry: {}", key);
        }
        Ok(removed)
    }

    /// Restart the TTL of a cached query; returns whether a fresh entry existed
    pub async fn touch(&self, query_kind: &str, params: &QueryParams) -> Result<bool> {
        let key = self.key_for(query_kind, params)?;
        let ttl = self.expiry.ttl_for(query_kind);

        if self.cache.native_ttl() {
            return Ok(self.bounded("EXPIRE", self.cache.expire(key.as_str(), ttl)).await?);
        }

        // The envelope carries stored_at, so re-arming means rewriting it
        let bytes = match self.bounded("GET", self.cache.get(key.as_str())).await? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        let cached = match self.classify(&key, &bytes) {
            CacheLookup::Hit(cached) => cached,
            _ => return Ok(false),
        };

        let encoded = self.codec.encode(&cached.value, Utc::now(), ttl)?;
        self.bounded("SET", self.cache.set(key.as_str(), encoded, ttl))
            .await?;
        Ok(true)
    }

    /// Snapshot of the coordinator's counters
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Number of keys currently being recomputed
    pub fn in_flight(&self) -> usize {
        self.guard.in_flight_count()
    }

    pub fn expiry_policy(&self) -> &ExpiryPolicy {
        &self.expiry
    }

    async fn lead<F, Fut>(
        &self,
        leader: LeaderGuard,
        query_kind: &str,
        double_check: bool,
        recompute: F,
    ) -> Result<QueryValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<QueryValue, StoreError>>,
    {
        let key = leader.key().clone();

        // Another leader may have stored the value between our miss and acquire
        if double_check {
            if let CacheLookup::Hit(cached) = self.read(&key).await {
                debug!("Value appeared while acquiring lease: {}", key);
                leader.succeed();
                return Ok(cached.value);
            }
        }

        debug!("Recomputing as leader: {}", key);
        match self.compute_and_store(&key, query_kind, recompute).await {
            Ok(value) => {
                leader.succeed();
                Ok(value)
            }
            Err(e) => {
                leader.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn follow<F, Fut>(
        &self,
        wait: FollowerWait,
        query_kind: &str,
        recompute: F,
    ) -> Result<QueryValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<QueryValue, StoreError>>,
    {
        let key = wait.key().clone();

        match wait.wait(self.policy.follower_timeout).await {
            WaitOutcome::Completed => {}
            WaitOutcome::LeaderFailed(message) => {
                if self.policy.propagate_leader_failure {
                    return Err(CacheError::LeaderFailed {
                        key: key.into_string(),
                        message,
                    });
                }
                debug!("Leader failed for {} ({}), retrying independently", key, message);
            }
            WaitOutcome::LeaderAbandoned => {
                debug!("Leader abandoned {}, retrying independently", key);
            }
            WaitOutcome::TimedOut => {
                StatsRecorder::incr(&self.stats.follower_timeouts);
                if !self.policy.follower_timeout.is_zero() {
                    warn!(
                        "Gave up waiting {:?} for leader of {}, recomputing independently",
                        self.policy.follower_timeout, key
                    );
                }
            }
        }

        if let CacheLookup::Hit(cached) = self.read(&key).await {
            debug!("Follower served from leader's write: {}", key);
            StatsRecorder::incr(&self.stats.follower_hits);
            return Ok(cached.value);
        }

        self.compute_and_store(&key, query_kind, recompute).await
    }

    async fn compute_and_store<F, Fut>(
        &self,
        key: &CacheKey,
        query_kind: &str,
        recompute: F,
    ) -> Result<QueryValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<QueryValue, StoreError>>,
    {
        StatsRecorder::incr(&self.stats.recomputations);

        let value = match recompute().await {
            Ok(value) => value,
            Err(e) => {
                StatsRecorder::incr(&self.stats.recompute_failures);
                debug!("Recomputation of {} failed: {}", key, e);
                return Err(CacheError::Store(e));
            }
        };

        let ttl = self.expiry.ttl_for(query_kind);
        let encoded = self.codec.encode(&value, Utc::now(), ttl).map_err(|e| {
            error!("Fresh result for {} cannot be encoded: {}", key, e);
            e
        })?;

        match self.bounded("SET", self.cache.set(key.as_str(), encoded, ttl)).await {
            Ok(()) => debug!("Stored {} for {:?}", key, ttl),
            Err(e) => self.note_cache_error("SET", key, &e),
        }

        Ok(value)
    }

    async fn read(&self, key: &CacheKey) -> CacheLookup {
        match self.bounded("GET", self.cache.get(key.as_str())).await {
            Ok(Some(bytes)) => self.classify(key, &bytes),
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                self.note_cache_error("GET", key, &e);
                CacheLookup::Miss
            }
        }
    }

    fn classify(&self, key: &CacheKey, bytes: &[u8]) -> CacheLookup {
        let cached = match self.codec.decode(bytes) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring undecodable cache entry {}: {}", key, e);
                return CacheLookup::Corrupt(e.to_string());
            }
        };

        if !self.cache.native_ttl() && ExpiryPolicy::is_stale(cached.stored_at, cached.ttl, Utc::now()) {
            debug!("Cache entry stale: {}", key);
            return CacheLookup::Stale;
        }

        CacheLookup::Hit(cached)
    }

    fn record(&self, lookup: &CacheLookup) {
        let counter = match lookup {
            CacheLookup::Hit(_) => &self.stats.hits,
            CacheLookup::Miss => &self.stats.misses,
            CacheLookup::Stale => &self.stats.stale,
            CacheLookup::Corrupt(_) => &self.stats.corrupt,
        };
        StatsRecorder::incr(counter);
    }

    fn note_cache_error(&self, operation: &str, key: &CacheKey, error: &CacheStoreError) {
        StatsRecorder::incr(&self.stats.cache_errors);
        warn!(
            "Cache store {} {} failed for {}, continuing without cache: {}",
            self.cache.name(),
            operation,
            key,
            error
        );
    }

    async fn bounded<T, F>(&self, operation: &str, op: F) -> std::result::Result<T, CacheStoreError>
    where
        F: Future<Output = std::result::Result<T, CacheStoreError>>,
    {
        tokio::time::timeout(self.cache_timeout, op)
            .await
            .unwrap_or_else(|_| Err(CacheStoreError::timeout(self.cache_timeout, operation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Field, Row};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(store: InMemoryCacheStore, ttl: Duration) -> CacheAsideCoordinator {
        let config = CacheAsideConfig::builder().default_ttl(ttl).build();
        CacheAsideCoordinator::new(Arc::new(store), &config).unwrap()
    }

    fn rows() -> QueryValue {
        QueryValue::rows(vec![(27, "Christopher Nolan"), (14, "Denis Villeneuve")])
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let params = QueryParams::new();

        for _ in 0..3 {
            let value = coordinator
                .get("count_by_director", &params, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(rows())
                })
                .await
                .unwrap();
            assert_eq!(value, rows());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.recomputations, 1);
    }

    #[tokio::test]
    async fn test_empty_rows_are_cached() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let params = QueryParams::new();

        for _ in 0..2 {
            let value = coordinator
                .get("count_by_director", &params, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(QueryValue::Rows(Vec::new()))
                })
                .await
                .unwrap();
            assert_eq!(value, QueryValue::Rows(Vec::new()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_error_reaches_caller_and_is_not_cached() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let params = QueryParams::new();

        let err = coordinator
            .get("count_by_director", &params, || async {
                Err(StoreError::Query("relation does not exist".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Query(_))));

        assert_eq!(
            coordinator.lookup("count_by_director", &params).await.unwrap(),
            CacheLookup::Miss
        );
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_encoding_failure_is_surfaced() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));

        let err = coordinator
            .get("avg_rating", &QueryParams::new(), || async {
                Ok(QueryValue::Rows(vec![Row::new(vec![Field::Float(f64::NAN)])]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Encoding(_)));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_parameter_never_recomputes() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let mut params = QueryParams::new();
        params.insert("min_rating".to_string(), f64::NAN.into());

        let calls = AtomicUsize::new(0);
        let err = coordinator
            .get("count_by_director", &params, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(rows())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::InvalidParameter(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_staleness_without_native_ttl() {
        let store = InMemoryCacheStore::without_native_ttl(100);
        let coordinator = coordinator(store, Duration::from_millis(100));
        let params = QueryParams::new();

        coordinator
            .get("count_by_director", &params, || async { Ok(rows()) })
            .await
            .unwrap();
        assert!(coordinator.lookup("count_by_director", &params).await.unwrap().is_hit());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            coordinator.lookup("count_by_director", &params).await.unwrap(),
            CacheLookup::Stale
        );
    }

    #[tokio::test]
    async fn test_refresh_overwrites() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let params = QueryParams::new();

        coordinator
            .get("total", &params, || async { Ok(QueryValue::Integer(41)) })
            .await
            .unwrap();
        let refreshed = coordinator
            .refresh("total", &params, || async { Ok(QueryValue::Integer(42)) })
            .await
            .unwrap();
        assert_eq!(refreshed, QueryValue::Integer(42));

        let cached = coordinator
            .get("total", &params, || async { Ok(QueryValue::Integer(0)) })
            .await
            .unwrap();
        assert_eq!(cached, QueryValue::Integer(42));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let coordinator = coordinator(InMemoryCacheStore::default(), Duration::from_secs(60));
        let params = QueryParams::new();

        coordinator
            .get("total", &params, || async { Ok(QueryValue::Integer(1)) })
            .await
            .unwrap();

        assert!(coordinator.invalidate("total", &params).await.unwrap());
        assert!(!coordinator.invalidate("total", &params).await.unwrap());
        assert_eq!(coordinator.lookup("total", &params).await.unwrap(), CacheLookup::Miss);
        assert_eq!(coordinator.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_touch_rearms_local_ttl() {
        let store = InMemoryCacheStore::without_native_ttl(100);
        let coordinator = coordinator(store, Duration::from_millis(200));
        let params = QueryParams::new();

        coordinator
            .get("total", &params, || async { Ok(QueryValue::Integer(1)) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(coordinator.touch("total", &params).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(coordinator.lookup("total", &params).await.unwrap().is_hit());
        assert!(!coordinator.touch("missing", &params).await.unwrap());
    }
}
