//! Background purge of terminal extraction jobs.
//!
//! Terminal jobs stay in the registry for a grace window so late status
//! polls can still see them; this service removes them afterwards.

use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ExtractionJobRegistry;

/// Periodically purges expired terminal jobs.
pub struct JobPurgeService {
    registry: ExtractionJobRegistry,
    check_interval: Duration,
}

impl JobPurgeService {
    pub fn new(registry: ExtractionJobRegistry, check_interval: Duration) -> Self {
        Self {
            registry,
            check_interval,
        }
    }

    /// Run a single purge; returns the number of jobs removed.
    pub fn run_purge(&self) -> usize {
        let purged = self.registry.purge_expired();
        if purged > 0 {
            info!(purged, "Purged finished extraction jobs");
        } else {
            debug!("No extraction jobs to purge");
        }
        purged
    }

    /// Start the background purge task.
    pub fn start_background_task(self, cancellation_token: CancellationToken) {
        if self.check_interval.is_zero() {
            debug!("Extraction job purge disabled");
            return;
        }

        tokio::spawn(async move {
            let mut check_interval = interval(self.check_interval);
            info!(
                interval_secs = self.check_interval.as_secs(),
                "Extraction job purge started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Extraction job purge shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        self.run_purge();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{Artifact, ArtifactKind, ExtractionRequest};
    use crate::jobs::{JobKey, JobRole};

    #[tokio::test]
    async fn test_background_task_purges_and_stops() {
        let registry = ExtractionJobRegistry::new(1, Duration::ZERO);
        let key = JobKey::new("debate-9", ArtifactKind::Streaming);
        let JobRole::Leader(mut leader) = registry.acquire_or_join(key.clone()) else {
            panic!("expected leader");
        };
        registry.admit(&mut leader).await.unwrap();
        let request = ExtractionRequest::new("debate-9", ArtifactKind::Streaming);
        registry.complete(leader, Artifact::new(&request, "https://cdn/9.m3u8"));
        assert_eq!(registry.stats().succeeded, 1);

        let token = CancellationToken::new();
        JobPurgeService::new(registry.clone(), Duration::from_millis(10))
            .start_background_task(token.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.stats().succeeded, 0);
        token.cancel();
    }

    #[test]
    fn test_run_purge_with_nothing_to_do() {
        let registry = ExtractionJobRegistry::new(1, Duration::from_secs(60));
        assert_eq!(JobPurgeService::new(registry, Duration::from_secs(1)).run_purge(), 0);
    }
}
