//! In-process cache tier.
//!
//! A bounded LRU map with per-entry expiry. Used as the secondary tier of
//! [`super::TieredCache`] and on its own when no primary is configured.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheBackend, CacheError};

/// A cached value with its expiration time.
#[derive(Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded in-memory cache with least-recently-used eviction.
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, CacheEntry>>,
    evictions: AtomicU64,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Build with a plain capacity, clamping zero to one entry.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    /// Get a live entry, refreshing its recency.
    ///
    /// Expired entries are dropped on access.
    pub fn get_entry(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key)?.is_expired(Instant::now());
        if expired {
            entries.pop(key);
            return None;
        }
        entries.peek(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace an entry.
    ///
    /// When the cache is full, expired entries are reclaimed first; only then
    /// is the least recently used live entry evicted.
    pub fn insert(&self, key: String, value: Bytes, ttl: Duration) {
        let mut entries = self.entries.lock();

        if !entries.contains(&key) && entries.len() == entries.cap().get() {
            let now = Instant::now();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                entries.pop(k);
            }
        }

        if let Some((evicted, _)) = entries.push(key.clone(), CacheEntry::new(value, ttl))
            && evicted != key
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &keys {
            entries.pop(k);
        }
        keys.len()
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            entries.pop(k);
        }
        expired.len()
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Number of live entries evicted to make room.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.remove(key))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        Ok(self.remove_prefix(prefix))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
