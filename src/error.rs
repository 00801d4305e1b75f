//! Error types for cache-aside operations
//!
//! This module defines the error taxonomy for the aggregate-cache library:
//! failures of the coordinator itself ([`CacheError`]), failures of the
//! persistent store during recomputation ([`StoreError`]) and failures of the
//! cache store ([`CacheStoreError`]), which the coordinator downgrades to misses.

use thiserror::Error;

/// Main error type returned to callers of the coordinator
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key derivation could not canonicalize the query kind or a parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A freshly computed value could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Stored bytes could not be turned back into a value
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// The persistent store failed while recomputing
    #[error("Persistent store error: {0}")]
    Store(#[from] StoreError),

    /// The cache store could not be reached
    #[error("Cache store unavailable: {0}")]
    CacheUnavailable(#[from] CacheStoreError),

    /// The leader recomputing this key failed and failures are propagated to followers
    #[error("Leader recomputation failed for key {key}: {message}")]
    LeaderFailed { key: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for cache-aside operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Failure of the persistent store executing an aggregate query
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection error - network or connection pool issues
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),

    /// No query is registered under the requested kind
    #[error("Unknown query kind: {0}")]
    UnknownQuery(String),

    /// Neo4rs driver error (wrapper)
    #[error("Neo4rs driver error: {0}")]
    Driver(#[from] neo4rs::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        StoreError::Other(s)
    }
}

impl From<&str> for StoreError {
    fn from(s: &str) -> Self {
        StoreError::Other(s.to_string())
    }
}

/// Failure of the cache store; never fatal to a `get`
#[derive(Error, Debug)]
pub enum CacheStoreError {
    /// Connection to the cache store failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Cache operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { timeout_ms: u64, operation: String },

    /// The store rejected or failed a command
    #[error("Command error: {0}")]
    Command(String),

    /// Redis driver error (wrapper)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl CacheStoreError {
    /// Timeout of `operation` after `timeout`, saturating at `u64::MAX` ms
    pub fn timeout(timeout: std::time::Duration, operation: impl Into<String>) -> Self {
        CacheStoreError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::InvalidParameter("empty query kind".to_string());
        assert_eq!(error.to_string(), "Invalid parameter: empty query kind");

        let timeout = CacheStoreError::Timeout {
            timeout_ms: 250,
            operation: "GET qc:v1".to_string(),
        };
        assert!(timeout.to_string().contains("timed out after 250ms"));

        let leader = CacheError::LeaderFailed {
            key: "qc:v1:5:count".to_string(),
            message: "boom".to_string(),
        };
        assert!(leader.to_string().contains("qc:v1:5:count"));
    }

    #[test]
    fn test_error_conversion() {
        let error: StoreError = "test error".into();
        assert!(matches!(error, StoreError::Other(_)));

        let error: StoreError = "test error".to_string().into();
        assert!(matches!(error, StoreError::Other(_)));

        let wrapped: CacheError = StoreError::Query("syntax".to_string()).into();
        assert!(matches!(wrapped, CacheError::Store(StoreError::Query(_))));

        let unavailable: CacheError = CacheStoreError::Connection("refused".to_string()).into();
        assert!(matches!(unavailable, CacheError::CacheUnavailable(_)));
    }

    #[test]
    fn test_timeout_saturates_milliseconds() {
        let err = CacheStoreError::timeout(std::time::Duration::from_millis(1500), "GET");
        assert!(matches!(err, CacheStoreError::Timeout { timeout_ms: 1500, .. }));

        let err = CacheStoreError::timeout(std::time::Duration::MAX, "SET");
        assert!(matches!(
            err,
            CacheStoreError::Timeout { timeout_ms: u64::MAX, ref operation } if operation == "SET"
        ));
    }
}
