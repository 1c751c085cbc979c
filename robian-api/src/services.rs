//! Service container.
//!
//! Builds the cache, job registry, extractor and coordinator from
//! configuration and owns the background tasks' lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::cache::{CacheStats, TieredCache};
use crate::config::AppConfig;
use crate::coordinator::ExtractionCoordinator;
use crate::extraction::{Extractor, YtDlpExtractor};
use crate::jobs::{ExtractionJobRegistry, JobEvent, JobPurgeService, RegistryStats};

/// Grace period for background tasks to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Combined statistics of the running services.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub jobs: RegistryStats,
}

/// Holds all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub cache: Arc<TieredCache>,
    pub registry: ExtractionJobRegistry,
    pub coordinator: Arc<ExtractionCoordinator>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the services with the yt-dlp extractor.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let extractor = YtDlpExtractor::new(config.extraction.clone());
        match extractor.probe().await {
            Some(version) => info!(version = %version, "yt-dlp available"),
            None => warn!("yt-dlp unavailable, extractions will fail until it is installed"),
        }
        Self::with_extractor(config, Arc::new(extractor)).await
    }

    /// Build the services around a custom extractor.
    pub async fn with_extractor(config: AppConfig, extractor: Arc<dyn Extractor>) -> Result<Self> {
        info!("Initializing service container");
        let cancellation_token = CancellationToken::new();

        let cache = Arc::new(TieredCache::from_config(&config.cache));
        cache.connect().await;
        cache.start_sweep_task(config.cache.sweep_interval, cancellation_token.clone());

        let registry = ExtractionJobRegistry::from_config(&config.extraction);
        JobPurgeService::new(registry.clone(), config.extraction.purge_interval)
            .start_background_task(cancellation_token.clone());

        let coordinator = Arc::new(
            ExtractionCoordinator::new(
                Arc::clone(&cache),
                registry.clone(),
                extractor,
                config.extraction.timeout,
            )
            .with_cancellation(cancellation_token.child_token()),
        );

        if let Some(ref dir) = config.logging.logs_dir {
            crate::logging::start_retention_cleanup(dir.clone(), cancellation_token.clone());
        }

        info!(
            max_concurrent = config.extraction.max_concurrent,
            timeout_secs = config.extraction.timeout.as_secs(),
            redis = config.cache.redis_url.is_some(),
            "Service container initialized"
        );

        Ok(Self {
            config,
            cache,
            registry,
            coordinator,
            cancellation_token,
        })
    }

    /// Subscribe to extraction job state transitions.
    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            jobs: self.registry.stats(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop background tasks and abort running extractions.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down services");
        self.registry.close();
        self.cancellation_token.cancel();

        // Give background tasks time to observe the cancellation.
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        info!("Services shut down");
        Ok(())
    }
}
