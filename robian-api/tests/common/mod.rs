//! Shared test doubles.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use robian_api::cache::{CacheBackend, CacheError, MemoryBackend, TieredCache, TtlPolicy};
use robian_api::coordinator::ExtractionCoordinator;
use robian_api::error::ExtractionError;
use robian_api::extraction::{Artifact, ExtractionRequest, Extractor};
use robian_api::jobs::ExtractionJobRegistry;

/// What the scripted extractor does when called.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Never finishes on its own.
    Hang,
}

/// Extractor double that records calls and concurrency.
pub struct ScriptedExtractor {
    behavior: Mutex<Behavior>,
    delay: Duration,
    calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    max_running: AtomicUsize,
    started: Mutex<Vec<String>>,
}

/// Decrements the running count when an extraction ends or is dropped.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedExtractor {
    pub fn new(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            delay,
            calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Resource ids in the order their extraction started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        _cancel: CancellationToken,
    ) -> Result<Artifact, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(request.resource_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(Arc::clone(&self.running));

        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Succeed => {
                tokio::time::sleep(self.delay).await;
                Ok(Artifact::new(
                    request,
                    format!("https://cdn.example/{}.m3u8", request.resource_id),
                ))
            }
            Behavior::Fail(reason) => {
                tokio::time::sleep(self.delay).await;
                Err(ExtractionError::failed(&request.resource_id, reason))
            }
        }
    }
}

/// Primary cache double: records TTLs and can be switched off.
#[derive(Default)]
pub struct RecordingBackend {
    pub down: AtomicBool,
    /// Number of upcoming reads that report a miss regardless of contents.
    pub hidden_reads: AtomicUsize,
    entries: Mutex<HashMap<String, (Bytes, Duration)>>,
}

impl RecordingBackend {
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries.lock().get(key).map(|(_, ttl)| *ttl)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.check()?;
        let hidden = self
            .hidden_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        Ok(self.entries.lock().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), (value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }
}

pub fn memory_cache() -> Arc<TieredCache> {
    Arc::new(TieredCache::memory_only(128, TtlPolicy::default()))
}

pub fn tiered_cache(primary: Arc<RecordingBackend>) -> Arc<TieredCache> {
    Arc::new(TieredCache::new(
        Some(primary as Arc<dyn CacheBackend>),
        Arc::new(MemoryBackend::with_capacity(128)),
        TtlPolicy::default(),
        Duration::ZERO,
    ))
}

pub fn coordinator(
    cache: Arc<TieredCache>,
    registry: ExtractionJobRegistry,
    extractor: Arc<ScriptedExtractor>,
    timeout: Duration,
) -> Arc<ExtractionCoordinator> {
    Arc::new(ExtractionCoordinator::new(cache, registry, extractor, timeout))
}
