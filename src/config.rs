//! Configuration for the cache-aside coordinator

use crate::error::{CacheError, Result};
use crate::expiry::ExpiryPolicy;
use crate::key::DEFAULT_KEY_PREFIX;
use crate::stampede::StampedePolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the cache-aside coordinator
///
/// Defaults:
/// - TTL: 1 hour for every query kind, no jitter
/// - Followers wait up to 5 seconds for a leader, then recompute themselves
/// - Cache-store operations are abandoned after 2 seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheAsideConfig {
    /// Namespace prefix of every derived key
    pub key_prefix: String,

    /// Time-to-live applied to every query kind without an override
    pub default_ttl: Duration,

    /// Per-query-kind TTL overrides
    pub ttl_overrides: HashMap<String, Duration>,

    /// TTL jitter factor (0.0 - 1.0)
    /// Spreads expiry of entries written together
    pub ttl_jitter: f64,

    /// Upper bound on a follower's wait for the leader; zero disables waiting
    pub follower_timeout: Duration,

    /// Whether followers receive the leader's failure instead of retrying
    pub propagate_leader_failure: bool,

    /// Upper bound on any single cache-store operation
    pub cache_operation_timeout: Duration,

    /// Redis URL for the cache store; in-memory when absent
    pub redis_url: Option<String>,
}

impl Default for CacheAsideConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: Duration::from_secs(3600),
            ttl_overrides: HashMap::new(),
            ttl_jitter: 0.0,
            follower_timeout: Duration::from_secs(5),
            propagate_leader_failure: false,
            cache_operation_timeout: Duration::from_secs(2),
            redis_url: None,
        }
    }
}

impl CacheAsideConfig {
    /// Create a new builder for the configuration
    pub fn builder() -> CacheAsideConfigBuilder {
        CacheAsideConfigBuilder::default()
    }

    /// Load configuration from the environment, reading `.env` first if present
    ///
    /// Recognized variables:
    /// - `QUERY_CACHE_KEY_PREFIX`
    /// - `QUERY_CACHE_DEFAULT_TTL_SECS`
    /// - `QUERY_CACHE_TTL_JITTER`
    /// - `QUERY_CACHE_FOLLOWER_TIMEOUT_MS`
    /// - `QUERY_CACHE_PROPAGATE_LEADER_FAILURE`
    /// - `QUERY_CACHE_STORE_TIMEOUT_MS`
    /// - `REDIS_URL`
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();

        if let Some(prefix) = lookup("QUERY_CACHE_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "QUERY_CACHE_DEFAULT_TTL_SECS")? {
            builder = builder.default_ttl(Duration::from_secs(secs));
        }
        if let Some(jitter) = parse_var::<f64>(&lookup, "QUERY_CACHE_TTL_JITTER")? {
            builder = builder.ttl_jitter(jitter);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QUERY_CACHE_FOLLOWER_TIMEOUT_MS")? {
            builder = builder.follower_timeout(Duration::from_millis(ms));
        }
        if let Some(propagate) = parse_var::<bool>(&lookup, "QUERY_CACHE_PROPAGATE_LEADER_FAILURE")? {
            builder = builder.propagate_leader_failure(propagate);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QUERY_CACHE_STORE_TIMEOUT_MS")? {
            builder = builder.cache_operation_timeout(Duration::from_millis(ms));
        }
        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.trim().is_empty()) {
            builder = builder.redis_url(url);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() || self.key_prefix.contains('\0') {
            return Err(CacheError::Config(
                "key_prefix must be non-empty and free of NUL characters".to_string(),
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(CacheError::Config(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        if let Some((kind, _)) = self.ttl_overrides.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(CacheError::Config(format!(
                "TTL override for '{}' must be greater than 0",
                kind
            )));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::Config(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.cache_operation_timeout.is_zero() {
            return Err(CacheError::Config(
                "cache_operation_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Expiry policy described by this configuration
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        self.ttl_overrides
            .iter()
            .fold(ExpiryPolicy::fixed(self.default_ttl), |policy, (kind, ttl)| {
                policy.with_ttl_for(kind.clone(), *ttl)
            })
            .with_jitter(self.ttl_jitter)
    }

    /// Stampede policy described by this configuration
    pub fn stampede_policy(&self) -> StampedePolicy {
        StampedePolicy {
            follower_timeout: self.follower_timeout,
            propagate_leader_failure: self.propagate_leader_failure,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("invalid {}={:?}: {}", name, raw, e))),
    }
}

/// Builder for the configuration
#[derive(Debug, Default)]
pub struct CacheAsideConfigBuilder {
    key_prefix: Option<String>,
    default_ttl: Option<Duration>,
    ttl_overrides: HashMap<String, Duration>,
    ttl_jitter: Option<f64>,
    follower_timeout: Option<Duration>,
    propagate_leader_failure: Option<bool>,
    cache_operation_timeout: Option<Duration>,
    redis_url: Option<String>,
}

impl CacheAsideConfigBuilder {
    /// Set the key namespace prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Override the TTL of one query kind
    pub fn ttl_for(mut self, query_kind: impl Into<String>, ttl: Duration) -> Self {
        self.ttl_overrides.insert(query_kind.into(), ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set the follower wait bound
    pub fn follower_timeout(mut self, timeout: Duration) -> Self {
        self.follower_timeout = Some(timeout);
        self
    }

    /// Propagate leader failures to followers
    pub fn propagate_leader_failure(mut self, propagate: bool) -> Self {
        self.propagate_leader_failure = Some(propagate);
        self
    }

    /// Set the cache-store operation timeout
    pub fn cache_operation_timeout(mut self, timeout: Duration) -> Self {
        self.cache_operation_timeout = Some(timeout);
        self
    }

    /// Use Redis at `url` as the cache store
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> CacheAsideConfig {
        let defaults = CacheAsideConfig::default();

        CacheAsideConfig {
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            ttl_overrides: self.ttl_overrides,
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            follower_timeout: self.follower_timeout.unwrap_or(defaults.follower_timeout),
            propagate_leader_failure: self
                .propagate_leader_failure
                .unwrap_or(defaults.propagate_leader_failure),
            cache_operation_timeout: self
                .cache_operation_timeout
                .unwrap_or(defaults.cache_operation_timeout),
            redis_url: self.redis_url.or(defaults.redis_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CacheAsideConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.key_prefix, "qc");
        assert_eq!(config.ttl_jitter, 0.0);
        assert!(!config.propagate_leader_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = CacheAsideConfig::default();
        invalid.default_ttl = Duration::ZERO;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheAsideConfig::default();
        invalid.ttl_jitter = 1.5;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheAsideConfig::default();
        invalid.key_prefix = String::new();
        assert!(invalid.validate().is_err());

        let invalid = CacheAsideConfig::builder()
            .ttl_for("top_rated", Duration::ZERO)
            .build();
        assert!(matches!(invalid.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheAsideConfig::builder()
            .default_ttl(Duration::from_secs(600))
            .ttl_for("top_rated", Duration::from_secs(30))
            .follower_timeout(Duration::from_millis(250))
            .propagate_leader_failure(true)
            .key_prefix("movies")
            .build();

        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.key_prefix, "movies");

        let expiry = config.expiry_policy();
        assert_eq!(expiry.ttl_for("top_rated"), Duration::from_secs(30));
        assert_eq!(expiry.ttl_for("count_by_director"), Duration::from_secs(600));

        let stampede = config.stampede_policy();
        assert_eq!(stampede.follower_timeout, Duration::from_millis(250));
        assert!(stampede.propagate_leader_failure);
    }

    #[test]
    fn test_from_lookup() {
        let config = CacheAsideConfig::from_lookup(lookup_from(&[
            ("QUERY_CACHE_KEY_PREFIX", "movies"),
            ("QUERY_CACHE_DEFAULT_TTL_SECS", "120"),
            ("QUERY_CACHE_TTL_JITTER", "0.1"),
            ("QUERY_CACHE_FOLLOWER_TIMEOUT_MS", "0"),
            ("QUERY_CACHE_PROPAGATE_LEADER_FAILURE", "true"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]))
        .unwrap();

        assert_eq!(config.key_prefix, "movies");
        assert_eq!(config.default_ttl, Duration::from_secs(120));
        assert_eq!(config.ttl_jitter, 0.1);
        assert_eq!(config.follower_timeout, Duration::ZERO);
        assert!(config.propagate_leader_failure);
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.cache_operation_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = CacheAsideConfig::from_lookup(lookup_from(&[(
            "QUERY_CACHE_DEFAULT_TTL_SECS",
            "an hour",
        )]));
        assert!(matches!(result, Err(CacheError::Config(_))));

        let result = CacheAsideConfig::from_lookup(lookup_from(&[("QUERY_CACHE_TTL_JITTER", "2")]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_blank_redis_url_is_ignored() {
        let config = CacheAsideConfig::from_lookup(lookup_from(&[("REDIS_URL", "  ")])).unwrap();
        assert!(config.redis_url.is_none());
    }
}
