//! Redis-backed cache store
//!
//! Entries are written with `PSETEX`, so Redis expires them natively with
//! millisecond precision. Every command is bounded by an operation timeout;
//! a slow or unreachable server surfaces as a [`CacheStoreError`], which the
//! coordinator treats as a miss.

use crate::error::CacheStoreError;
use crate::store::CacheStore;
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// [`CacheStore`] over a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisCacheStore {
    connection: MultiplexedConnection,
    operation_timeout: Duration,
}

impl RedisCacheStore {
    /// Connect to Redis and verify the connection with `PING`
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `operation_timeout` - Upper bound for every cache command
    pub async fn connect(url: &str, operation_timeout: Duration) -> Result<Self, CacheStoreError> {
        info!("Connecting to Redis cache store at {}", url);

        let client = Client::open(url)
            .map_err(|e| CacheStoreError::Connection(format!("invalid redis url {}: {}", url, e)))?;

        let connection = tokio::time::timeout(
            operation_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheStoreError::timeout(operation_timeout, format!("connect {}", url)))?
        .map_err(|e| CacheStoreError::Connection(format!("failed to connect to {}: {}", url, e)))?;

        let store = Self {
            connection,
            operation_timeout,
        };

        let mut conn = store.connection.clone();
        let pong: String = store
            .bounded("PING", ::redis::cmd("PING").query_async(&mut conn))
            .await?;
        if pong != "PONG" {
            return Err(CacheStoreError::Command(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }

        info!("Redis cache store connection established");
        Ok(store)
    }

    async fn bounded<T, F>(&self, operation: &str, command: F) -> Result<T, CacheStoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, command).await {
            Ok(result) => result.map_err(|e| {
                debug!("Redis {} failed: {}", operation, e);
                CacheStoreError::Redis(e)
            }),
            Err(_) => Err(CacheStoreError::timeout(self.operation_timeout, operation)),
        }
    }
}

/// Redis rejects non-positive expiry times
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        let mut conn = self.connection.clone();
        self.bounded("GET", ::redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        let mut conn = self.connection.clone();
        self.bounded(
            "PSETEX",
            ::redis::cmd("PSETEX")
                .arg(key)
                .arg(ttl_millis(ttl))
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .bounded("DEL", ::redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
        let mut conn = self.connection.clone();
        let updated: i64 = self
            .bounded(
                "PEXPIRE",
                ::redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
