//! External collaborators of the coordinator
//!
//! - [`CacheStore`]: a fast key-value service holding encoded entries.
//!   Operations are best-effort; the coordinator turns their failures into
//!   misses.
//! - [`PersistentStore`]: the slow store that executes aggregate queries.

pub mod memory;
pub mod neo4j;
pub mod redis;

use crate::codec::QueryValue;
use crate::error::{CacheStoreError, StoreError};
use crate::key::QueryParams;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryCacheStore;
pub use neo4j::{AggregateQuery, Neo4jAggregateStore, ResultShape};
pub use self::redis::RedisCacheStore;

/// Key-value cache service
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the bytes stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError>;

    /// Remove `key`; returns whether an entry existed
    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// Reset the expiry of `key` to `ttl` from now; returns whether the key exists
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError>;

    /// Whether the store drops entries by itself once their TTL elapses
    ///
    /// When false, the coordinator checks staleness from the entry envelope.
    fn native_ttl(&self) -> bool {
        true
    }

    /// Short name for log lines
    fn name(&self) -> &'static str;
}

/// Executor of expensive aggregate queries
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn execute_aggregate_query(
        &self,
        query_kind: &str,
        params: &QueryParams,
    ) -> Result<QueryValue, StoreError>;
}
