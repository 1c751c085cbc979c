//! Integration tests for artifact resolution: deduplication, concurrency
//! ceiling, caching, timeouts and failure propagation.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;

use common::{Behavior, RecordingBackend, ScriptedExtractor, coordinator, memory_cache, tiered_cache};
use robian_api::cache::CacheNamespace;
use robian_api::error::ExtractionError;
use robian_api::extraction::{Artifact, ArtifactKind, ExtractionRequest};
use robian_api::jobs::{ExtractionJobRegistry, JobState};

const LONG: Duration = Duration::from_secs(30);

fn registry(max_concurrent: usize) -> ExtractionJobRegistry {
    ExtractionJobRegistry::new(max_concurrent, Duration::from_secs(60))
}

mod dedup_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolves_extract_once() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(100));
        let coord = coordinator(memory_cache(), registry(3), extractor.clone(), LONG);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move { coord.resolve("debate-42", ArtifactKind::Streaming).await })
            })
            .collect();

        let results: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(extractor.calls(), 1);
        assert!(results.iter().all(|artifact| artifact == &results[0]));
        assert_eq!(results[0].location, "https://cdn.example/debate-42.m3u8");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_fans_out_to_every_caller() {
        let extractor = ScriptedExtractor::new(
            Behavior::Fail("yt-dlp exited with code 1"),
            Duration::from_millis(100),
        );
        let coord = coordinator(memory_cache(), registry(3), extractor.clone(), LONG);

        let results = join_all((0..8).map(|_| coord.resolve("debate-13", ArtifactKind::Audio))).await;

        assert_eq!(extractor.calls(), 1);
        let expected = ExtractionError::failed("debate-13", "yt-dlp exited with code 1");
        for result in results {
            assert_eq!(result.unwrap_err(), expected);
        }
        let job = coord.status("debate-13", ArtifactKind::Audio).unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_streaming_and_audio_are_separate_jobs() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(20));
        let coord = coordinator(memory_cache(), registry(3), extractor.clone(), LONG);

        let (stream, audio) = tokio::join!(
            coord.resolve("debate-42", ArtifactKind::Streaming),
            coord.resolve("debate-42", ArtifactKind::Audio),
        );

        assert_eq!(stream.unwrap().kind, ArtifactKind::Streaming);
        assert_eq!(audio.unwrap().kind, ArtifactKind::Audio);
        assert_eq!(extractor.calls(), 2);
    }
}

mod ceiling_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_running_jobs_never_exceed_ceiling() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(80));
        let coord = coordinator(memory_cache(), registry(2), extractor.clone(), LONG);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move {
                    coord
                        .resolve(&format!("debate-{i}"), ArtifactKind::Streaming)
                        .await
                })
            })
            .collect();

        // Sample the registry while the batch drains.
        let mut observed_max = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            observed_max = observed_max.max(coord.registry().stats().running);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(extractor.calls(), 6);
        assert!(extractor.max_running() <= 2, "max running {}", extractor.max_running());
        assert!(observed_max <= 2);
        assert_eq!(coord.registry().stats().available_slots, 2);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(20));
        let coord = coordinator(memory_cache(), registry(1), extractor.clone(), LONG);

        let ids = ["a", "b", "c", "d"];
        let results = join_all(ids.iter().map(|id| coord.resolve(id, ArtifactKind::Streaming))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(extractor.started(), ids.map(String::from).to_vec());
    }

    #[tokio::test]
    async fn test_queue_limit_rejects_excess_work() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(300));
        let registry = ExtractionJobRegistry::with_queue_limit(
            1,
            Duration::from_secs(60),
            Some(Duration::from_millis(50)),
        );
        let coord = coordinator(memory_cache(), registry, extractor.clone(), LONG);

        let (first, second) = tokio::join!(
            coord.resolve("busy", ArtifactKind::Streaming),
            coord.resolve("late", ArtifactKind::Streaming),
        );

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(ExtractionError::CapacityExceeded { waited_secs: 1, .. })
        ));
        assert_eq!(extractor.calls(), 1);
    }
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_cold_then_warm_resolve() {
        let primary = Arc::new(RecordingBackend::default());
        let cache = tiered_cache(primary.clone());
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(10));
        let coord = coordinator(cache.clone(), registry(2), extractor.clone(), LONG);

        let cold = coord
            .resolve("debate-42", ArtifactKind::Streaming)
            .await
            .unwrap();
        assert_eq!(extractor.calls(), 1);
        assert!(cache.get(CacheNamespace::Streaming, "debate-42").await.is_some());
        assert_eq!(
            primary.ttl_of("streaming:debate-42"),
            Some(cache.ttl_for(CacheNamespace::Streaming))
        );

        let warm = coord
            .resolve("debate-42", ArtifactKind::Streaming)
            .await
            .unwrap();
        assert_eq!(warm, cold);
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn test_audio_artifacts_cached_under_metadata() {
        let primary = Arc::new(RecordingBackend::default());
        let cache = tiered_cache(primary.clone());
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::ZERO);
        let coord = coordinator(cache, registry(2), extractor, LONG);

        coord.resolve("debate-42", ArtifactKind::Audio).await.unwrap();

        assert_eq!(
            primary.ttl_of("metadata:audio:debate-42"),
            Some(Duration::from_secs(86400))
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_stops_extraction() {
        let extractor = ScriptedExtractor::new(Behavior::Hang, Duration::ZERO);
        let timeout = Duration::from_millis(300);
        let coord = coordinator(memory_cache(), registry(1), extractor.clone(), timeout);

        let started = Instant::now();
        let err = coord
            .resolve("debate-99", ArtifactKind::Streaming)
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err:?}");
        assert!(matches!(err, ExtractionError::Timeout { timeout_secs: 1, .. }));
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
        assert_eq!(extractor.running(), 0, "hung extraction was not torn down");

        let job = coord.status("debate-99", ArtifactKind::Streaming).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(coord.registry().stats().available_slots, 1);
    }

    #[tokio::test]
    async fn test_leader_served_by_late_cache_write_runs_nothing() {
        let primary = Arc::new(RecordingBackend::default());
        let cache = tiered_cache(primary.clone());
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::ZERO);
        let coord = coordinator(cache.clone(), registry(1), extractor.clone(), LONG);
        let mut events = coord.registry().subscribe();

        let stored = Artifact::new(
            &ExtractionRequest::new("debate-11", ArtifactKind::Streaming),
            "https://cdn.example/debate-11.m3u8",
        );
        cache
            .set_key(
                &stored.cache_key(),
                Bytes::from(serde_json::to_vec(&stored).unwrap()),
                None,
            )
            .await;
        // The first lookup misses, as if the write landed just after it.
        primary.hidden_reads.store(1, Ordering::SeqCst);

        let artifact = coord
            .resolve("debate-11", ArtifactKind::Streaming)
            .await
            .unwrap();

        assert_eq!(artifact, stored);
        assert_eq!(extractor.calls(), 0);
        assert!(coord.status("debate-11", ArtifactKind::Streaming).is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retry_after_failed_job_is_purged() {
        let extractor = ScriptedExtractor::new(Behavior::Fail("network unreachable"), Duration::ZERO);
        let registry = ExtractionJobRegistry::new(1, Duration::ZERO);
        let coord = coordinator(memory_cache(), registry, extractor.clone(), LONG);

        assert!(coord.resolve("debate-7", ArtifactKind::Audio).await.is_err());
        assert_eq!(coord.registry().purge_expired(), 1);
        assert!(coord.status("debate-7", ArtifactKind::Audio).is_none());

        extractor.set_behavior(Behavior::Succeed);
        let artifact = coord.resolve("debate-7", ArtifactKind::Audio).await.unwrap();

        assert_eq!(artifact.resource_id, "debate-7");
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_extraction() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::ZERO);
        let coord = coordinator(memory_cache(), registry(1), extractor.clone(), LONG);

        coord.resolve("debate-5", ArtifactKind::Streaming).await.unwrap();
        coord.invalidate("debate-5", ArtifactKind::Streaming).await;
        coord.resolve("debate-5", ArtifactKind::Streaming).await.unwrap();

        assert_eq!(extractor.calls(), 2);
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_abandoned_follower_does_not_cancel_job() {
        let extractor = ScriptedExtractor::new(Behavior::Succeed, Duration::from_millis(150));
        let coord = coordinator(memory_cache(), registry(1), extractor.clone(), LONG);

        let leader = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.resolve("debate-1", ArtifactKind::Streaming).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quitter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.resolve("debate-1", ArtifactKind::Streaming).await })
        };
        let patient = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.resolve("debate-1", ArtifactKind::Streaming).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            coord.status("debate-1", ArtifactKind::Streaming).unwrap().waiters,
            2
        );

        quitter.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            coord.status("debate-1", ArtifactKind::Streaming).unwrap().waiters,
            1
        );

        assert!(leader.await.unwrap().is_ok());
        assert!(patient.await.unwrap().is_ok());
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_leader_fails_followers() {
        let extractor = ScriptedExtractor::new(Behavior::Hang, Duration::ZERO);
        let coord = coordinator(memory_cache(), registry(1), extractor.clone(), LONG);

        let leader = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.resolve("debate-2", ArtifactKind::Streaming).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.resolve("debate-2", ArtifactKind::Streaming).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();

        let result = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follower never woke up")
            .unwrap();
        assert!(matches!(result, Err(ExtractionError::Cancelled { .. })));
        assert_eq!(extractor.running(), 0);
        assert_eq!(coord.registry().stats().available_slots, 1);
    }
}
