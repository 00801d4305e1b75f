//! In-process cache store with TTL expiry and LRU eviction

use crate::error::CacheStoreError;
use crate::store::CacheStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// In-memory [`CacheStore`]
///
/// This implementation provides:
/// - Thread-safe async access via RwLock
/// - Native TTL expiration (lazily on read, or via [`purge_expired`](Self::purge_expired))
/// - LRU eviction once `max_entries` is reached, with O(log n) recency updates
///
/// Built with [`without_native_ttl`](Self::without_native_ttl) it keeps
/// entries until evicted or deleted, like a store with no expiry support.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    max_entries: usize,
    native_ttl: bool,
    inner: Arc<RwLock<MemoryInner>>,
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
    /// Position in `lru_order`
    last_access: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    /// Access tick to key, least recently used first
    lru_order: BTreeMap<u64, String>,
    clock: u64,
    evictions: u64,
}

impl MemoryInner {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            let previous = std::mem::replace(&mut entry.last_access, tick);
            self.lru_order.remove(&previous);
            self.lru_order.insert(tick, key.to_string());
        }
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, expires_at: Option<DateTime<Utc>>) {
        let entry = MemoryEntry {
            value,
            expires_at,
            last_access: 0,
        };
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.lru_order.remove(&old.last_access);
        }
        self.touch(key);
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.lru_order.remove(&entry.last_access);
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryCacheStore {
    /// Create a store holding at most `max_entries` entries
    pub fn new(max_entries: usize) -> Self {
        info!(
            "Initializing in-memory cache store (max_entries: {})",
            max_entries
        );
        Self {
            max_entries: max_entries.max(1),
            native_ttl: true,
            inner: Arc::new(RwLock::new(MemoryInner::default())),
        }
    }

    /// Create a store that ignores TTLs and never expires entries itself
    pub fn without_native_ttl(max_entries: usize) -> Self {
        Self {
            native_ttl: false,
            ..Self::new(max_entries)
        }
    }

    /// Number of entries currently held, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Number of entries evicted to respect `max_entries`
    pub async fn evictions(&self) -> u64 {
        self.inner.read().await.evictions
    }

    /// Remove every entry
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        let count = inner.entries.len();
        inner.entries.clear();
        inner.lru_order.clear();
        info!("Cleared {} entries from in-memory cache store", count);
    }

    /// Remove all expired entries, returning their keys
    pub async fn purge_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }

        if !expired.is_empty() {
            debug!("Purged {} expired entries", expired.len());
        }
        expired
    }

    /// Spawn a background task purging expired entries every `interval`
    pub fn spawn_purge_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        info!(
            "Starting in-memory cache purge task (interval: {:?})",
            interval
        );

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.purge_expired().await;
            }
        })
    }

    fn expiry_from_now(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        if !self.native_ttl {
            return None;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Some(Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        let mut inner = self.inner.write().await;

        let expired = match inner.entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(Utc::now()),
        };

        if expired {
            debug!("In-memory entry expired: {}", key);
            inner.remove(key);
            return Ok(None);
        }

        inner.touch(key);
        Ok(inner.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        let expires_at = self.expiry_from_now(ttl);
        let mut inner = self.inner.write().await;

        if !inner.entries.contains_key(key) {
            while inner.entries.len() >= self.max_entries {
                let Some((_, oldest)) = inner.lru_order.pop_first() else {
                    break;
                };
                debug!("Evicting entry due to max_entries limit: {}", oldest);
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            }
        }

        inner.insert(key, value, expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.inner.write().await.remove(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
        let expires_at = self.expiry_from_now(ttl);
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            Some(_) => {
                inner.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn native_ttl(&self) -> bool {
        self.native_ttl
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
