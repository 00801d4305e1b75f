//! Demonstrates cache-aside reads of an aggregate query
//!
//! This example shows how to:
//! - Load the coordinator configuration from the environment
//! - Serve repeated reads from the cache
//! - Collapse concurrent misses into a single recomputation
//!
//! Set `REDIS_URL` to use Redis; otherwise an in-memory store is used.

use aggregate_cache::{
    CacheAsideConfig, CacheAsideCoordinator, PersistentStore, QueryParams, QueryValue, StoreError,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Stand-in for a slow graph database
struct SlowMovieStore {
    executions: AtomicUsize,
}

#[async_trait]
impl PersistentStore for SlowMovieStore {
    async fn execute_aggregate_query(
        &self,
        query_kind: &str,
        params: &QueryParams,
    ) -> Result<QueryValue, StoreError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;

        match query_kind {
            "count_by_director" => Ok(QueryValue::rows(vec![
                (27, "Christopher Nolan"),
                (14, "Denis Villeneuve"),
            ])),
            "movies_since" => {
                let year = params.get("year").map(|v| v.to_string()).unwrap_or_default();
                Ok(QueryValue::Text(format!("movies released since {}", year)))
            }
            other => Err(StoreError::UnknownQuery(other.to_string())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CacheAsideConfig::from_env()?;
    println!("Using cache prefix '{}' with default TTL {:?}", config.key_prefix, config.default_ttl);

    let coordinator = CacheAsideCoordinator::from_config(config).await?;
    let store = SlowMovieStore {
        executions: AtomicUsize::new(0),
    };
    let params = QueryParams::new();

    // 1. Cold read
    println!("\n1. Cold read...");
    let start = Instant::now();
    let value = coordinator.get_aggregate(&store, "count_by_director", &params).await?;
    println!("   {:?} in {}ms", value, start.elapsed().as_millis());

    // 2. Warm read
    println!("\n2. Warm read...");
    let start = Instant::now();
    coordinator.get_aggregate(&store, "count_by_director", &params).await?;
    println!("   served in {}ms", start.elapsed().as_millis());

    // 3. Concurrent misses on a new key
    println!("\n3. Twenty concurrent reads of an uncached key...");
    let mut since = QueryParams::new();
    since.insert("year".to_string(), 2010i64.into());
    let results = join_all(
        (0..20).map(|_| coordinator.get_aggregate(&store, "movies_since", &since)),
    )
    .await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    println!("   {} callers answered", succeeded);

    // 4. Invalidation
    println!("\n4. Invalidating count_by_director...");
    let removed = coordinator.invalidate("count_by_director", &params).await?;
    println!("   removed: {}", removed);

    println!("\nPersistent store executions: {}", store.executions.load(Ordering::SeqCst));
    println!("{}", coordinator.stats());

    Ok(())
}
