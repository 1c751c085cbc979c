//! Two-tier cache with transparent fallback.
//!
//! Reads and writes go to the primary (networked) tier first. Any primary
//! failure is absorbed: the operation is served by the in-process tier and
//! the primary is marked down. The next call after the configured retry
//! window tries the primary again, and the first success restores
//! primary-first behaviour.
//!
//! Invalidations the primary could not apply are kept as pending tombstones.
//! While one is live the matching primary entry is treated as a miss, and the
//! pending deletions are replayed before the primary serves anything again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheBackend, CacheError, CacheKey, CacheNamespace, MemoryBackend, TtlPolicy};
use crate::Result;

/// Availability state of the primary tier.
///
/// Transitions use compare-and-swap so that concurrent failures produce a
/// single down transition (and a single warning).
struct PrimaryHealth {
    down: AtomicBool,
    /// Milliseconds since `origin` at which the primary was last marked down.
    down_at_ms: AtomicU64,
    origin: Instant,
    retry_after: Duration,
    failovers: AtomicU64,
}

impl PrimaryHealth {
    fn new(retry_after: Duration) -> Self {
        Self {
            down: AtomicBool::new(false),
            down_at_ms: AtomicU64::new(0),
            origin: Instant::now(),
            retry_after,
            failovers: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Whether the primary should be attempted for this call.
    fn should_attempt(&self) -> bool {
        if !self.is_down() {
            return true;
        }
        let since = self
            .now_ms()
            .saturating_sub(self.down_at_ms.load(Ordering::Acquire));
        since >= self.retry_after.as_millis() as u64
    }

    /// Returns true if this call performed the up -> down transition.
    fn mark_down(&self) -> bool {
        self.down_at_ms.store(self.now_ms(), Ordering::Release);
        let transitioned = self
            .down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            self.failovers.fetch_add(1, Ordering::Relaxed);
        }
        transitioned
    }

    /// Returns true if this call performed the down -> up transition.
    fn mark_up(&self) -> bool {
        self.is_down()
            && self
                .down
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// Invalidations not yet applied to the primary, with their expiry.
///
/// A tombstone lives as long as the namespace TTL, after which any entry it
/// shadows has expired on the primary too.
#[derive(Default)]
struct PendingInvalidations {
    keys: HashMap<String, Instant>,
    prefixes: HashMap<String, Instant>,
}

impl PendingInvalidations {
    fn prune(&mut self, now: Instant) {
        self.keys.retain(|_, expires_at| *expires_at > now);
        self.prefixes.retain(|_, expires_at| *expires_at > now);
    }

    fn len(&self) -> usize {
        self.keys.len() + self.prefixes.len()
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.prefixes.is_empty()
    }

    fn covers(&self, key: &str, now: Instant) -> bool {
        self.keys.get(key).is_some_and(|expires_at| *expires_at > now)
            || self
                .prefixes
                .iter()
                .any(|(prefix, expires_at)| *expires_at > now && key.starts_with(prefix.as_str()))
    }
}

#[derive(Default)]
struct Counters {
    primary_hits: AtomicU64,
    secondary_hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub primary_backend: Option<&'static str>,
    pub primary_available: bool,
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub memory_evictions: u64,
    pub primary_hits: u64,
    pub secondary_hits: u64,
    pub misses: u64,
    /// Operations served by the secondary because the primary failed or was down.
    pub fallbacks: u64,
    /// Number of up -> down transitions of the primary.
    pub failovers: u64,
    /// Invalidations waiting for the primary to come back.
    pub pending_invalidations: usize,
}

/// Cache facade combining a networked primary and an in-process secondary.
pub struct TieredCache {
    primary: Option<Arc<dyn CacheBackend>>,
    secondary: Arc<MemoryBackend>,
    ttl: TtlPolicy,
    health: PrimaryHealth,
    counters: Counters,
    pending: Mutex<PendingInvalidations>,
}

impl TieredCache {
    /// Create a cache with an optional primary tier.
    pub fn new(
        primary: Option<Arc<dyn CacheBackend>>,
        secondary: Arc<MemoryBackend>,
        ttl: TtlPolicy,
        primary_retry_after: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            ttl,
            health: PrimaryHealth::new(primary_retry_after),
            counters: Counters::default(),
            pending: Mutex::new(PendingInvalidations::default()),
        }
    }

    /// Memory-only cache.
    pub fn memory_only(capacity: usize, ttl: TtlPolicy) -> Self {
        Self::new(
            None,
            Arc::new(MemoryBackend::with_capacity(capacity)),
            ttl,
            Duration::ZERO,
        )
    }

    /// Probe the primary once, e.g. at startup. Failure only marks it down.
    pub async fn connect(&self) -> bool {
        let Some(primary) = self.primary.as_ref() else {
            return false;
        };
        match primary.ping().await {
            Ok(()) => {
                self.health.mark_up();
                info!(backend = primary.name(), "Primary cache connected");
                true
            }
            Err(e) => {
                self.on_primary_error(primary.as_ref(), "connect", None, &e);
                false
            }
        }
    }

    /// The primary, if it may be used for this call.
    ///
    /// Pending invalidations are replayed first; the primary is only handed
    /// out once all of them have been applied. A skipped or failed primary
    /// counts as a fallback.
    async fn ready_primary(&self) -> Option<&Arc<dyn CacheBackend>> {
        let primary = self.primary.as_ref()?;
        if !self.health.should_attempt() {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.replay_pending(primary.as_ref()).await {
            Ok(()) => Some(primary),
            Err(e) => {
                self.on_primary_error(primary.as_ref(), "replay", None, &e);
                None
            }
        }
    }

    async fn replay_pending(
        &self,
        primary: &dyn CacheBackend,
    ) -> std::result::Result<(), CacheError> {
        let (keys, prefixes): (Vec<_>, Vec<_>) = {
            let mut pending = self.pending.lock();
            pending.prune(Instant::now());
            if pending.is_empty() {
                return Ok(());
            }
            (
                pending.keys.iter().map(|(k, at)| (k.clone(), *at)).collect(),
                pending.prefixes.iter().map(|(p, at)| (p.clone(), *at)).collect(),
            )
        };

        for (prefix, recorded) in &prefixes {
            primary.delete_prefix(prefix).await?;
            let mut pending = self.pending.lock();
            if pending.prefixes.get(prefix) == Some(recorded) {
                pending.prefixes.remove(prefix);
            }
        }
        for (key, recorded) in &keys {
            primary.delete(key).await?;
            let mut pending = self.pending.lock();
            if pending.keys.get(key) == Some(recorded) {
                pending.keys.remove(key);
            }
        }

        info!(
            backend = primary.name(),
            keys = keys.len(),
            prefixes = prefixes.len(),
            "Replayed deferred invalidations on primary cache"
        );
        Ok(())
    }

    fn defer_invalidation(&self, entry: &str, namespace: CacheNamespace, is_prefix: bool) {
        let expires_at = Instant::now() + self.ttl.for_namespace(namespace);
        let mut pending = self.pending.lock();
        if is_prefix {
            pending.prefixes.insert(entry.to_string(), expires_at);
        } else {
            pending.keys.insert(entry.to_string(), expires_at);
        }
        warn!(
            entry,
            namespace = %namespace,
            pending = pending.len(),
            "Primary cache unreachable, invalidation deferred until it recovers"
        );
    }

    fn on_primary_success(&self, primary: &dyn CacheBackend) {
        if self.health.mark_up() {
            info!(backend = primary.name(), "Primary cache recovered");
        }
    }

    fn on_primary_error(
        &self,
        primary: &dyn CacheBackend,
        op: &'static str,
        key: Option<&CacheKey>,
        error: &CacheError,
    ) {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);

        if error.is_unavailable() {
            if self.health.mark_down() {
                warn!(
                    backend = primary.name(),
                    op,
                    error = %error,
                    "Primary cache unavailable, falling back to memory cache"
                );
            }
        } else {
            warn!(
                backend = primary.name(),
                op,
                key = key.map(CacheKey::as_str),
                error = %error,
                "Primary cache operation failed"
            );
        }
    }

    /// Look up `id` in `namespace`.
    pub async fn get(&self, namespace: CacheNamespace, id: &str) -> Option<Bytes> {
        self.get_key(&CacheKey::new(namespace, id)).await
    }

    /// Look up a fully built key.
    pub async fn get_key(&self, key: &CacheKey) -> Option<Bytes> {
        if let Some(primary) = self.ready_primary().await {
            match primary.get(key.as_str()).await {
                Ok(Some(value)) => {
                    self.on_primary_success(primary.as_ref());
                    // An invalidation deferred after the replay shadows this entry.
                    if self.pending.lock().covers(key.as_str(), Instant::now()) {
                        debug!(key = %key, "Ignoring invalidated primary entry");
                    } else {
                        self.counters.primary_hits.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Cache hit (primary)");
                        return Some(value);
                    }
                }
                Ok(None) => self.on_primary_success(primary.as_ref()),
                Err(e) => self.on_primary_error(primary.as_ref(), "get", Some(key), &e),
            }
        }

        match self.secondary.get_entry(key.as_str()) {
            Some(value) => {
                self.counters.secondary_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit (memory)");
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Store `value` under `id`, using the namespace TTL when `ttl` is `None`.
    pub async fn set(
        &self,
        namespace: CacheNamespace,
        id: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) {
        self.set_key(&CacheKey::new(namespace, id), value, ttl).await
    }

    /// Store a value under a fully built key. Never fails.
    pub async fn set_key(&self, key: &CacheKey, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.ttl.for_namespace(key.namespace()));

        if let Some(primary) = self.ready_primary().await {
            match primary.set(key.as_str(), value.clone(), ttl).await {
                Ok(()) => {
                    self.on_primary_success(primary.as_ref());
                    // A copy written during an outage must not outlive this one.
                    self.secondary.remove(key.as_str());
                    self.pending.lock().keys.remove(key.as_str());
                    debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached (primary)");
                    return;
                }
                Err(e) => self.on_primary_error(primary.as_ref(), "set", Some(key), &e),
            }
        }

        self.secondary.insert(key.as_str().to_string(), value, ttl);
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached (memory)");
    }

    /// Remove one entry from both tiers.
    pub async fn invalidate(&self, namespace: CacheNamespace, id: &str) {
        self.invalidate_key(&CacheKey::new(namespace, id)).await
    }

    ///
    /// When the primary cannot apply the deletion it is deferred: the entry
    /// stays hidden and is deleted once the primary is reachable again.
    pub async fn invalidate_key(&self, key: &CacheKey) {
        let mut applied = false;
        if let Some(primary) = self.ready_primary().await {
            match primary.delete(key.as_str()).await {
                Ok(_) => {
                    self.on_primary_success(primary.as_ref());
                    self.pending.lock().keys.remove(key.as_str());
                    applied = true;
                }
                Err(e) => self.on_primary_error(primary.as_ref(), "delete", Some(key), &e),
            }
        }
        if self.primary.is_some() && !applied {
            self.defer_invalidation(key.as_str(), key.namespace(), false);
        }
        self.secondary.remove(key.as_str());
        debug!(key = %key, "Cache entry invalidated");
    }

    /// Remove every entry of `namespace` from both tiers.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_namespace(&self, namespace: CacheNamespace) -> usize {
        let prefix = namespace.prefix();
        let mut removed = 0;
        let mut applied = false;

        if let Some(primary) = self.ready_primary().await {
            match primary.delete_prefix(&prefix).await {
                Ok(count) => {
                    self.on_primary_success(primary.as_ref());
                    let mut pending = self.pending.lock();
                    pending.prefixes.remove(&prefix);
                    pending.keys.retain(|k, _| !k.starts_with(prefix.as_str()));
                    removed += count;
                    applied = true;
                }
                Err(e) => self.on_primary_error(primary.as_ref(), "delete_prefix", None, &e),
            }
        }
        if self.primary.is_some() && !applied {
            self.defer_invalidation(&prefix, namespace, true);
        }
        removed += self.secondary.remove_prefix(&prefix);

        info!(namespace = %namespace, removed, "Cache namespace cleared");
        removed
    }

    /// Typed read; undecodable payloads count as a miss.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: CacheNamespace,
        id: &str,
    ) -> Option<T> {
        let key = CacheKey::new(namespace, id);
        let raw = self.get_key(&key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Typed write. Only serialization of `value` itself can fail.
    pub async fn set_json<T: Serialize>(
        &self,
        namespace: CacheNamespace,
        id: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.set(namespace, id, Bytes::from(raw), ttl).await;
        Ok(())
    }

    /// Default TTL applied to `namespace`.
    pub fn ttl_for(&self, namespace: CacheNamespace) -> Duration {
        self.ttl.for_namespace(namespace)
    }

    pub fn secondary(&self) -> &Arc<MemoryBackend> {
        &self.secondary
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            primary_backend: self.primary.as_ref().map(|p| p.name()),
            primary_available: self.primary.is_some() && !self.health.is_down(),
            memory_entries: self.secondary.len(),
            memory_capacity: self.secondary.capacity(),
            memory_evictions: self.secondary.evictions(),
            primary_hits: self.counters.primary_hits.load(Ordering::Relaxed),
            secondary_hits: self.counters.secondary_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            failovers: self.health.failovers.load(Ordering::Relaxed),
            pending_invalidations: self.pending.lock().len(),
        }
    }

    /// Start the background sweep of expired in-memory entries.
    pub fn start_sweep_task(
        self: &Arc<Self>,
        every: Duration,
        cancellation_token: CancellationToken,
    ) {
        if every.is_zero() {
            debug!("Memory cache sweep disabled");
            return;
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            info!(interval_secs = every.as_secs(), "Memory cache sweep started");

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Memory cache sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.secondary.cleanup_expired();
                        cache.pending.lock().prune(Instant::now());
                        if removed > 0 {
                            debug!(removed, "Swept expired memory cache entries");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    /// Primary double whose availability can be toggled.
    #[derive(Default)]
    struct FlakyBackend {
        down: AtomicBool,
        calls: AtomicUsize,
        store: Mutex<std::collections::HashMap<String, (Bytes, Duration)>>,
    }

    impl FlakyBackend {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> std::result::Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(CacheError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        fn stored_ttl(&self, key: &str) -> Option<Duration> {
            self.store.lock().get(key).map(|(_, ttl)| *ttl)
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, CacheError> {
            self.check()?;
            Ok(self.store.lock().get(key).map(|(v, _)| v.clone()))
        }

        async fn set(
            &self,
            key: &str,
            value: Bytes,
            ttl: Duration,
        ) -> std::result::Result<(), CacheError> {
            self.check()?;
            self.store.lock().insert(key.to_string(), (value, ttl));
            Ok(())
        }

        async fn delete(&self, key: &str) -> std::result::Result<bool, CacheError> {
            self.check()?;
            Ok(self.store.lock().remove(key).is_some())
        }

        async fn delete_prefix(&self, prefix: &str) -> std::result::Result<usize, CacheError> {
            self.check()?;
            let mut store = self.store.lock();
            let before = store.len();
            store.retain(|k, _| !k.starts_with(prefix));
            Ok(before - store.len())
        }

        async fn ping(&self) -> std::result::Result<(), CacheError> {
            self.check()
        }
    }

    fn tiered(primary: Arc<FlakyBackend>) -> TieredCache {
        TieredCache::new(
            Some(primary as Arc<dyn CacheBackend>),
            Arc::new(MemoryBackend::with_capacity(16)),
            TtlPolicy::default(),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_primary_first_when_healthy() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = tiered(primary.clone());

        cache
            .set(CacheNamespace::Streaming, "debate-1", Bytes::from("a"), None)
            .await;

        assert_eq!(
            cache.get(CacheNamespace::Streaming, "debate-1").await,
            Some(Bytes::from("a"))
        );
        assert!(cache.secondary().is_empty());
        assert_eq!(cache.stats().primary_hits, 1);
    }

    #[tokio::test]
    async fn test_namespace_ttl_used_when_unspecified() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = tiered(primary.clone());

        cache
            .set(CacheNamespace::Streaming, "debate-1", Bytes::from("a"), None)
            .await;
        cache
            .set(CacheNamespace::Debates, "list", Bytes::from("b"), None)
            .await;
        cache
            .set(
                CacheNamespace::Debates,
                "detail-1",
                Bytes::from("c"),
                Some(Duration::from_secs(5)),
            )
            .await;

        assert_eq!(
            primary.stored_ttl("streaming:debate-1"),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(primary.stored_ttl("debates:list"), Some(Duration::from_secs(300)));
        assert_eq!(primary.stored_ttl("debates:detail-1"), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_down() {
        let primary = Arc::new(FlakyBackend::default());
        primary.set_down(true);
        let cache = tiered(primary.clone());

        cache
            .set(CacheNamespace::Metadata, "audio:debate-1", Bytes::from("x"), None)
            .await;
        let value = cache.get(CacheNamespace::Metadata, "audio:debate-1").await;

        assert_eq!(value, Some(Bytes::from("x")));
        let stats = cache.stats();
        assert!(!stats.primary_available);
        assert_eq!(stats.failovers, 1);
        assert_eq!(stats.secondary_hits, 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_count_one_failover() {
        let primary = Arc::new(FlakyBackend::default());
        primary.set_down(true);
        let cache = tiered(primary.clone());

        for i in 0..5 {
            cache
                .set(CacheNamespace::Search, &format!("q{i}"), Bytes::from("r"), None)
                .await;
        }

        assert_eq!(cache.stats().failovers, 1);
        // Retry window is zero, so every call still tried the primary.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_recovers_on_next_call() {
        let primary = Arc::new(FlakyBackend::default());
        primary.set_down(true);
        let cache = tiered(primary.clone());

        cache
            .set(CacheNamespace::Streaming, "debate-1", Bytes::from("outage"), None)
            .await;
        assert!(!cache.stats().primary_available);

        primary.set_down(false);

        // Primary misses, value written during the outage is still served.
        assert_eq!(
            cache.get(CacheNamespace::Streaming, "debate-1").await,
            Some(Bytes::from("outage"))
        );
        assert!(cache.stats().primary_available);

        cache
            .set(CacheNamespace::Streaming, "debate-1", Bytes::from("fresh"), None)
            .await;
        assert_eq!(
            cache.get(CacheNamespace::Streaming, "debate-1").await,
            Some(Bytes::from("fresh"))
        );
        assert!(cache.secondary().is_empty());
    }

    #[tokio::test]
    async fn test_retry_window_skips_primary() {
        let primary = Arc::new(FlakyBackend::default());
        primary.set_down(true);
        let cache = TieredCache::new(
            Some(primary.clone() as Arc<dyn CacheBackend>),
            Arc::new(MemoryBackend::with_capacity(16)),
            TtlPolicy::default(),
            Duration::from_secs(60),
        );

        cache.get(CacheNamespace::Debates, "a").await;
        cache.get(CacheNamespace::Debates, "b").await;
        cache.get(CacheNamespace::Debates, "c").await;

        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_both_tiers() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = tiered(primary.clone());

        primary.set_down(true);
        cache
            .set(CacheNamespace::Debates, "detail-1", Bytes::from("m"), None)
            .await;
        primary.set_down(false);
        cache
            .set(CacheNamespace::Debates, "detail-2", Bytes::from("p"), None)
            .await;
        cache
            .secondary()
            .insert("debates:detail-1".to_string(), Bytes::from("m"), Duration::from_secs(60));

        cache.invalidate(CacheNamespace::Debates, "detail-1").await;
        assert!(cache.get(CacheNamespace::Debates, "detail-1").await.is_none());

        cache
            .set(CacheNamespace::Streaming, "s", Bytes::from("s"), None)
            .await;
        let removed = cache.invalidate_namespace(CacheNamespace::Debates).await;
        assert_eq!(removed, 1);
        assert!(cache.get(CacheNamespace::Debates, "detail-2").await.is_none());
        assert!(cache.get(CacheNamespace::Streaming, "s").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidation_during_outage_survives_recovery() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = tiered(primary.clone());
        cache
            .set(CacheNamespace::Debates, "d1", Bytes::from("old"), None)
            .await;

        primary.set_down(true);
        cache.invalidate(CacheNamespace::Debates, "d1").await;
        assert_eq!(cache.stats().pending_invalidations, 1);

        primary.set_down(false);
        assert!(cache.get(CacheNamespace::Debates, "d1").await.is_none());
        assert!(primary.stored_ttl("debates:d1").is_none());
        assert_eq!(cache.stats().pending_invalidations, 0);

        cache
            .set(CacheNamespace::Debates, "d1", Bytes::from("new"), None)
            .await;
        assert_eq!(
            cache.get(CacheNamespace::Debates, "d1").await,
            Some(Bytes::from("new"))
        );
    }

    #[tokio::test]
    async fn test_invalidated_entry_hidden_while_replay_is_skipped() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = TieredCache::new(
            Some(primary.clone() as Arc<dyn CacheBackend>),
            Arc::new(MemoryBackend::with_capacity(16)),
            TtlPolicy::default(),
            Duration::from_secs(60),
        );
        cache
            .set(CacheNamespace::Streaming, "debate-1", Bytes::from("old"), None)
            .await;

        primary.set_down(true);
        cache.invalidate(CacheNamespace::Streaming, "debate-1").await;
        primary.set_down(false);

        // Still inside the retry window: the primary is not consulted at all.
        assert!(cache.get(CacheNamespace::Streaming, "debate-1").await.is_none());
        assert_eq!(cache.stats().pending_invalidations, 1);
    }

    #[tokio::test]
    async fn test_namespace_invalidation_during_outage_survives_recovery() {
        let primary = Arc::new(FlakyBackend::default());
        let cache = tiered(primary.clone());
        cache
            .set(CacheNamespace::Debates, "a", Bytes::from("1"), None)
            .await;
        cache
            .set(CacheNamespace::Debates, "b", Bytes::from("2"), None)
            .await;
        cache
            .set(CacheNamespace::Search, "q", Bytes::from("3"), None)
            .await;

        primary.set_down(true);
        cache.invalidate_namespace(CacheNamespace::Debates).await;
        primary.set_down(false);

        assert!(cache.get(CacheNamespace::Debates, "a").await.is_none());
        assert!(cache.get(CacheNamespace::Debates, "b").await.is_none());
        assert_eq!(
            cache.get(CacheNamespace::Search, "q").await,
            Some(Bytes::from("3"))
        );
        assert!(primary.stored_ttl("debates:a").is_none());
        assert_eq!(cache.stats().pending_invalidations, 0);
    }

    #[test]
    fn test_pending_invalidations_expire() {
        let now = Instant::now();
        let mut pending = PendingInvalidations::default();
        pending
            .keys
            .insert("debates:d1".to_string(), now + Duration::from_secs(5));
        pending
            .prefixes
            .insert("search:".to_string(), now + Duration::from_secs(5));

        assert!(pending.covers("debates:d1", now));
        assert!(pending.covers("search:q", now));
        assert!(!pending.covers("debates:d2", now));

        let later = now + Duration::from_secs(10);
        assert!(!pending.covers("debates:d1", later));
        pending.prune(later);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_memory_only_ttl_expiry() {
        let cache = TieredCache::memory_only(8, TtlPolicy::default());
        cache
            .set(
                CacheNamespace::Streaming,
                "debate-1",
                Bytes::from("u"),
                Some(Duration::from_millis(30)),
            )
            .await;

        assert!(cache.get(CacheNamespace::Streaming, "debate-1").await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(CacheNamespace::Streaming, "debate-1").await.is_none());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Info {
            url: String,
        }

        let cache = TieredCache::memory_only(8, TtlPolicy::default());
        let info = Info {
            url: "https://cdn/1.m3u8".to_string(),
        };
        cache
            .set_json(CacheNamespace::Streaming, "debate-1", &info, None)
            .await
            .unwrap();

        let back: Option<Info> = cache.get_json(CacheNamespace::Streaming, "debate-1").await;
        assert_eq!(back, Some(info));

        cache
            .set(CacheNamespace::Streaming, "broken", Bytes::from("{not json"), None)
            .await;
        let broken: Option<Info> = cache.get_json(CacheNamespace::Streaming, "broken").await;
        assert!(broken.is_none());
    }
}
