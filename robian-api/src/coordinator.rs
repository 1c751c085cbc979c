//! Get-or-produce entry point for extraction artifacts.
//!
//! A cached artifact is returned immediately. Otherwise the caller either
//! leads a new extraction job or joins the one already in flight, so
//! concurrent requests for the same artifact run the external tool once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::error::ExtractionError;
use crate::extraction::{Artifact, ArtifactKind, ExtractionRequest, Extractor};
use crate::jobs::{ExtractionJob, ExtractionJobRegistry, JobKey, JobRole, LeaderHandle};

/// Resolves artifacts through the cache, the job registry and an extractor.
pub struct ExtractionCoordinator {
    cache: Arc<TieredCache>,
    registry: ExtractionJobRegistry,
    extractor: Arc<dyn Extractor>,
    timeout: Duration,
    cancellation_token: CancellationToken,
}

impl ExtractionCoordinator {
    pub fn new(
        cache: Arc<TieredCache>,
        registry: ExtractionJobRegistry,
        extractor: Arc<dyn Extractor>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            registry,
            extractor,
            timeout,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Tie running extractions to `token`; cancelling it aborts them.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn registry(&self) -> &ExtractionJobRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Return the artifact of `kind` for `resource_id`, extracting it if
    /// it is not cached.
    ///
    /// Every caller joined to the same job gets the same artifact or the
    /// same error. Failures are not retried here.
    pub async fn resolve(
        &self,
        resource_id: &str,
        kind: ArtifactKind,
    ) -> Result<Artifact, ExtractionError> {
        let started = Instant::now();

        if let Some(artifact) = self.cached(resource_id, kind).await {
            debug!(
                resource_id,
                kind = %kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Resolved from cache"
            );
            return Ok(artifact);
        }

        let result = match self.registry.acquire_or_join(JobKey::new(resource_id, kind)) {
            JobRole::Leader(leader) => self.lead(leader).await,
            JobRole::Follower(follower) => {
                debug!(
                    resource_id,
                    kind = %kind,
                    job_id = %follower.job_id(),
                    "Waiting for in-flight extraction"
                );
                follower.wait().await
            }
        };

        match &result {
            Ok(_) => info!(
                resource_id,
                kind = %kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Artifact resolved"
            ),
            Err(e) => warn!(
                resource_id,
                kind = %kind,
                code = e.code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Artifact resolution failed"
            ),
        }
        result
    }

    /// Drive a job as its leader, from admission to a terminal state.
    async fn lead(&self, mut leader: LeaderHandle) -> Result<Artifact, ExtractionError> {
        let key = leader.key().clone();

        // A previous leader may have stored the artifact between our cache
        // miss and becoming leader.
        if let Some(artifact) = self.cached(&key.resource_id, key.kind).await {
            self.registry.complete_from_cache(leader, artifact.clone());
            return Ok(artifact);
        }

        if let Err(e) = self.registry.admit(&mut leader).await {
            self.registry.fail(leader, e.clone());
            return Err(e);
        }

        match self.extract(&key).await {
            Ok(artifact) => {
                self.store(&artifact).await;
                self.registry.complete(leader, artifact.clone());
                Ok(artifact)
            }
            Err(e) => {
                self.registry.fail(leader, e.clone());
                Err(e)
            }
        }
    }

    /// Run the extractor under the hard timeout.
    ///
    /// On timeout the extractor future is dropped, which kills its process.
    async fn extract(&self, key: &JobKey) -> Result<Artifact, ExtractionError> {
        let request = ExtractionRequest::new(key.resource_id.clone(), key.kind);
        let cancel = self.cancellation_token.child_token();

        debug!(
            resource_id = %key.resource_id,
            kind = %key.kind,
            extractor = self.extractor.name(),
            "Starting extraction"
        );

        match tokio::time::timeout(self.timeout, self.extractor.extract(&request, cancel.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ExtractionError::Timeout {
                    resource_id: key.resource_id.clone(),
                    timeout_secs: self.timeout.as_secs_f64().ceil() as u64,
                })
            }
        }
    }

    async fn cached(&self, resource_id: &str, kind: ArtifactKind) -> Option<Artifact> {
        let key = kind.cache_key(resource_id);
        let raw = self.cache.get_key(&key).await?;
        match serde_json::from_slice(&raw) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring undecodable cached artifact");
                None
            }
        }
    }

    async fn store(&self, artifact: &Artifact) {
        match serde_json::to_vec(artifact) {
            Ok(raw) => {
                self.cache
                    .set_key(&artifact.cache_key(), Bytes::from(raw), None)
                    .await
            }
            Err(e) => warn!(
                resource_id = %artifact.resource_id,
                error = %e,
                "Could not serialize artifact for caching"
            ),
        }
    }

    /// Drop the cached artifact so the next resolve extracts again.
    pub async fn invalidate(&self, resource_id: &str, kind: ArtifactKind) {
        self.cache.invalidate_key(&kind.cache_key(resource_id)).await;
    }

    /// Current job for (`resource_id`, `kind`), if one is in flight or
    /// recently finished.
    pub fn status(&self, resource_id: &str, kind: ArtifactKind) -> Option<ExtractionJob> {
        self.registry.status(&JobKey::new(resource_id, kind))
    }
}
