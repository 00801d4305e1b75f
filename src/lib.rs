//! # Aggregate Cache (aggregate-cache)
//!
//! A cache-aside layer for expensive aggregate queries against Neo4j.
//!
//! ## Features
//!
//! - Deterministic cache keys derived from a query kind and its parameters
//! - Versioned JSON envelopes carrying the value, write time and TTL
//! - Per-query-kind TTLs with optional jitter
//! - Stampede protection: one recomputation per key, concurrent callers wait
//! - Redis or in-memory cache stores; cache outages degrade to direct queries
//!
//! ## Read-through a Neo4j aggregate
//!
//! ```no_run
//! use aggregate_cache::{
//!     AggregateQuery, CacheAsideConfig, CacheAsideCoordinator,
//!     Neo4jAggregateStore, QueryParams,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Neo4jAggregateStore::connect(
//!         "bolt://localhost:7687",
//!         "neo4j",
//!         "password",
//!         "neo4j"
//!     )
//!     .await?
//!     .register(
//!         "count_by_director",
//!         AggregateQuery::rows(
//!             "MATCH (p:Person)-[:DIRECTED]->(m:Movie) \
//!              RETURN count(m) AS movies, p.name AS director ORDER BY movies DESC",
//!             ["movies", "director"],
//!         ),
//!     );
//!
//!     let coordinator = CacheAsideCoordinator::from_config(CacheAsideConfig::from_env()?).await?;
//!
//!     let counts = coordinator
//!         .get_aggregate(&store, "count_by_director", &QueryParams::new())
//!         .await?;
//!     println!("{:?}", counts);
//!     println!("{}", coordinator.stats());
//!     Ok(())
//! }
//! ```
//!
//! ## Cache keys
//!
//! ```
//! use aggregate_cache::CacheKeyBuilder;
//!
//! let key = CacheKeyBuilder::new("count_by_director")
//!     .param("director", "Nolan")
//!     .build()
//!     .unwrap();
//! assert_eq!(key.as_str(), "qc:v1:17:count_by_director;8:director=s5:Nolan");
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expiry;
pub mod key;
pub mod stampede;
pub mod stats;
pub mod store;

// Re-export main types for convenience
pub use codec::{CachedValue, Field, JsonCodec, QueryValue, Row, SerializationCodec};
pub use config::{CacheAsideConfig, CacheAsideConfigBuilder};
pub use coordinator::{CacheAsideCoordinator, CacheLookup};
pub use error::{CacheError, CacheStoreError, Result, StoreError};
pub use expiry::ExpiryPolicy;
pub use key::{CacheKey, CacheKeyBuilder, ParamValue, QueryParams, DEFAULT_KEY_PREFIX};
pub use stampede::{Acquired, FollowerWait, LeaderGuard, StampedeGuard, StampedePolicy, WaitOutcome};
pub use stats::CacheStats;
pub use store::{
    AggregateQuery, CacheStore, InMemoryCacheStore, Neo4jAggregateStore, PersistentStore,
    RedisCacheStore, ResultShape,
};
