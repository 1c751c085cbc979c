//! Extraction job registry.
//!
//! Guarantees at most one non-terminal job per [`JobKey`] and bounds the
//! number of jobs in `Running` state. The first caller for a key becomes the
//! job's leader and drives it; callers arriving while it is in flight join as
//! followers and receive the leader's outcome.
//!
//! All job map mutations happen under a single mutex. The concurrency ceiling
//! is a fair semaphore, so leaders are admitted in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OnceCell, OwnedSemaphorePermit, Semaphore, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ExtractionJob, JobEvent, JobKey, JobState};
use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::extraction::Artifact;

/// Buffered job events per subscriber before lagging ones start missing some.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Terminal outcome of a job, shared with every joined caller.
pub type JobOutcome = std::result::Result<Artifact, ExtractionError>;

/// One-shot outcome cell that any number of followers can await.
struct InFlightState {
    result: OnceCell<JobOutcome>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: JobOutcome) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> JobOutcome {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

struct JobEntry {
    job: ExtractionJob,
    outcome: Arc<InFlightState>,
    enqueued_at: Instant,
    finished_at: Option<Instant>,
}

impl JobEntry {
    fn is_expired(&self, retention: Duration, now: Instant) -> bool {
        self.finished_at
            .is_some_and(|finished| now.duration_since(finished) >= retention)
    }
}

struct RegistryInner {
    jobs: Mutex<HashMap<JobKey, JobEntry>>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    max_queue_wait: Option<Duration>,
    retention: Duration,
    events: broadcast::Sender<JobEvent>,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Followers currently joined to in-flight jobs.
    pub waiters: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
}

/// Result of [`ExtractionJobRegistry::acquire_or_join`].
pub enum JobRole {
    /// The caller created the job and must drive it to a terminal state.
    Leader(LeaderHandle),
    /// The caller joined a job already in flight.
    Follower(FollowerHandle),
}

/// Handle owned by the caller driving a job.
///
/// Dropping it before [`ExtractionJobRegistry::complete`] or
/// [`ExtractionJobRegistry::fail`] fails the job as cancelled, which wakes
/// every follower.
pub struct LeaderHandle {
    registry: ExtractionJobRegistry,
    key: JobKey,
    job_id: Uuid,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl LeaderHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Whether the job holds a concurrency slot.
    pub fn is_admitted(&self) -> bool {
        self.permit.is_some()
    }

    fn settle(&mut self, outcome: JobOutcome) {
        self.settled = true;
        self.registry.finish(&self.key, self.job_id, outcome);
        // The slot is released only once followers can see the outcome.
        self.permit.take();
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                resource_id = %self.key.resource_id,
                kind = %self.key.kind,
                job_id = %self.job_id,
                "Extraction leader dropped before finishing, cancelling job"
            );
            self.settle(Err(ExtractionError::Cancelled {
                resource_id: self.key.resource_id.clone(),
            }));
        }
    }
}

/// Handle held by a caller waiting on someone else's job.
///
/// Dropping it only removes the caller from the job's waiter count; the job
/// itself keeps running.
pub struct FollowerHandle {
    registry: ExtractionJobRegistry,
    key: JobKey,
    job_id: Uuid,
    outcome: Arc<InFlightState>,
}

impl FollowerHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the job's terminal outcome.
    pub async fn wait(&self) -> JobOutcome {
        self.outcome.wait().await
    }
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        self.registry.leave(&self.key, self.job_id);
    }
}

/// Tracks extraction jobs and enforces the concurrency ceiling.
#[derive(Clone)]
pub struct ExtractionJobRegistry {
    inner: Arc<RegistryInner>,
}

impl ExtractionJobRegistry {
    /// Create a registry admitting at most `max_concurrent` running jobs and
    /// keeping terminal jobs visible for `retention`.
    pub fn new(max_concurrent: usize, retention: Duration) -> Self {
        Self::with_queue_limit(max_concurrent, retention, None)
    }

    /// Like [`Self::new`], but admission gives up with
    /// [`ExtractionError::CapacityExceeded`] after `max_queue_wait`.
    pub fn with_queue_limit(
        max_concurrent: usize,
        retention: Duration,
        max_queue_wait: Option<Duration>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                jobs: Mutex::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                max_queue_wait,
                retention,
                events,
            }),
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::with_queue_limit(
            config.max_concurrent,
            config.job_retention,
            config.max_queue_wait,
        )
    }

    /// Subscribe to job state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Become the leader of a new job for `key`, or join the one in flight.
    ///
    /// A terminal job still retained for status polls does not count as in
    /// flight: failures are never cached, so a new leader is created.
    pub fn acquire_or_join(&self, key: JobKey) -> JobRole {
        let mut jobs = self.inner.jobs.lock();

        if let Some(entry) = jobs.get_mut(&key)
            && !entry.job.is_terminal()
        {
            entry.job.waiters += 1;
            debug!(
                resource_id = %key.resource_id,
                kind = %key.kind,
                job_id = %entry.job.job_id,
                waiters = entry.job.waiters,
                "Joined in-flight extraction"
            );
            return JobRole::Follower(FollowerHandle {
                registry: self.clone(),
                job_id: entry.job.job_id,
                outcome: Arc::clone(&entry.outcome),
                key,
            });
        }

        let job = ExtractionJob::queued(&key);
        let job_id = job.job_id;
        jobs.insert(
            key.clone(),
            JobEntry {
                job,
                outcome: Arc::new(InFlightState::new()),
                enqueued_at: Instant::now(),
                finished_at: None,
            },
        );
        drop(jobs);

        debug!(
            resource_id = %key.resource_id,
            kind = %key.kind,
            job_id = %job_id,
            "Extraction job queued"
        );

        JobRole::Leader(LeaderHandle {
            registry: self.clone(),
            key,
            job_id,
            permit: None,
            settled: false,
        })
    }

    /// Wait for a concurrency slot, then move the job to `Running`.
    ///
    /// The `Queued` event is emitted here rather than on creation, so a job
    /// settled from the cache never announces itself.
    ///
    /// On error the job is left `Queued`; the leader is expected to
    /// [`fail`](Self::fail) it with the returned error.
    pub async fn admit(&self, leader: &mut LeaderHandle) -> Result<(), ExtractionError> {
        if leader.is_admitted() {
            return Ok(());
        }

        let resource_id = leader.key.resource_id.clone();
        let created_at = self
            .inner
            .jobs
            .lock()
            .get(&leader.key)
            .filter(|entry| entry.job.job_id == leader.job_id)
            .map(|entry| entry.job.created_at);
        let Some(created_at) = created_at else {
            return Err(self.invariant_violation(format!(
                "queued job {} for {} is no longer registered",
                leader.job_id, leader.key
            )));
        };
        self.emit(JobEvent::Queued {
            job_id: leader.job_id,
            resource_id: resource_id.clone(),
            kind: leader.key.kind,
            at: created_at,
        });

        let acquire = Arc::clone(&self.inner.slots).acquire_owned();
        let acquired = match self.inner.max_queue_wait {
            Some(max_wait) => match tokio::time::timeout(max_wait, acquire).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    let waited_secs = max_wait.as_secs_f64().ceil() as u64;
                    info!(
                        resource_id = %resource_id,
                        waited_secs,
                        "No extraction slot within the queue limit"
                    );
                    return Err(ExtractionError::CapacityExceeded {
                        resource_id,
                        waited_secs,
                    });
                }
            },
            None => acquire.await,
        };
        let permit = acquired.map_err(|_| ExtractionError::Cancelled {
            resource_id: resource_id.clone(),
        })?;

        let now = Utc::now();
        let queued_ms = {
            let mut jobs = self.inner.jobs.lock();
            let Some(entry) = jobs
                .get_mut(&leader.key)
                .filter(|entry| entry.job.job_id == leader.job_id)
            else {
                return Err(self.invariant_violation(format!(
                    "admitted job {} for {} is no longer registered",
                    leader.job_id, leader.key
                )));
            };
            entry.job.state = JobState::Running;
            entry.job.started_at = Some(now);
            entry.enqueued_at.elapsed().as_millis() as u64
        };
        leader.permit = Some(permit);

        debug!(
            resource_id = %resource_id,
            kind = %leader.key.kind,
            job_id = %leader.job_id,
            queued_ms,
            "Extraction job running"
        );
        self.emit(JobEvent::Running {
            job_id: leader.job_id,
            resource_id,
            kind: leader.key.kind,
            at: now,
            queued_ms,
        });
        Ok(())
    }

    /// Mark the job succeeded and hand `artifact` to every follower.
    pub fn complete(&self, mut leader: LeaderHandle, artifact: Artifact) {
        leader.settle(Ok(artifact));
    }

    /// Hand an artifact found in the cache to every follower and drop the
    /// job without recording a transition, since nothing was extracted.
    pub fn complete_from_cache(&self, mut leader: LeaderHandle, artifact: Artifact) {
        leader.settled = true;
        let outcome = {
            let mut jobs = self.inner.jobs.lock();
            let owned = jobs.get(&leader.key).is_some_and(|entry| {
                entry.job.job_id == leader.job_id && !entry.job.is_terminal()
            });
            if owned {
                jobs.remove(&leader.key).map(|entry| entry.outcome)
            } else {
                None
            }
        };

        let Some(outcome) = outcome else {
            self.invariant_violation(format!(
                "cached job {} for {} is no longer registered",
                leader.job_id, leader.key
            ));
            return;
        };
        debug!(
            resource_id = %leader.key.resource_id,
            kind = %leader.key.kind,
            job_id = %leader.job_id,
            "Extraction job settled from cache"
        );
        outcome.set_result(Ok(artifact));
    }

    /// Mark the job failed and hand `error` to every follower.
    pub fn fail(&self, mut leader: LeaderHandle, error: ExtractionError) {
        leader.settle(Err(error));
    }

    fn finish(&self, key: &JobKey, job_id: Uuid, outcome: JobOutcome) {
        let now = Utc::now();
        let state = {
            let mut jobs = self.inner.jobs.lock();
            let Some(entry) = jobs
                .get_mut(key)
                .filter(|entry| entry.job.job_id == job_id)
            else {
                drop(jobs);
                self.invariant_violation(format!(
                    "finished job {job_id} for {key} is no longer registered"
                ));
                return;
            };
            if entry.job.is_terminal() {
                return;
            }

            match &outcome {
                Ok(artifact) => {
                    entry.job.state = JobState::Succeeded;
                    entry.job.result = Some(artifact.clone());
                }
                Err(error) => {
                    entry.job.state = JobState::Failed;
                    entry.job.error = Some(error.clone());
                }
            }
            entry.job.finished_at = Some(now);
            entry.finished_at = Some(Instant::now());
            Arc::clone(&entry.outcome)
        };

        let event = match &outcome {
            Ok(artifact) => {
                info!(
                    resource_id = %key.resource_id,
                    kind = %key.kind,
                    job_id = %job_id,
                    "Extraction job succeeded"
                );
                JobEvent::Succeeded {
                    job_id,
                    resource_id: key.resource_id.clone(),
                    kind: key.kind,
                    at: now,
                    location: artifact.location.clone(),
                }
            }
            Err(error) => {
                warn!(
                    resource_id = %key.resource_id,
                    kind = %key.kind,
                    job_id = %job_id,
                    code = error.code(),
                    error = %error,
                    "Extraction job failed"
                );
                JobEvent::Failed {
                    job_id,
                    resource_id: key.resource_id.clone(),
                    kind: key.kind,
                    at: now,
                    error: error.clone(),
                }
            }
        };

        state.set_result(outcome);
        self.emit(event);
    }

    fn leave(&self, key: &JobKey, job_id: Uuid) {
        let mut jobs = self.inner.jobs.lock();
        // The job may already have been purged or replaced.
        let Some(entry) = jobs
            .get_mut(key)
            .filter(|entry| entry.job.job_id == job_id)
        else {
            return;
        };

        debug_assert!(entry.job.waiters > 0, "waiter count underflow for {key}");
        match entry.job.waiters.checked_sub(1) {
            Some(waiters) => entry.job.waiters = waiters,
            None => {
                drop(jobs);
                self.invariant_violation(format!("waiter count underflow for job {job_id}"));
            }
        }
    }

    fn invariant_violation(&self, detail: String) -> ExtractionError {
        error!(detail = %detail, "Extraction registry invariant violated");
        ExtractionError::InvariantViolation { detail }
    }

    /// Snapshot of the job for `key`, if any is in flight or still retained.
    pub fn status(&self, key: &JobKey) -> Option<ExtractionJob> {
        let jobs = self.inner.jobs.lock();
        jobs.get(key)
            .filter(|entry| !entry.is_expired(self.inner.retention, Instant::now()))
            .map(|entry| entry.job.clone())
    }

    /// Drop terminal jobs older than the retention window.
    ///
    /// Returns the number of jobs removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.inner.retention;
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.is_expired(retention, now));
        before - jobs.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let jobs = self.inner.jobs.lock();
        let mut stats = RegistryStats {
            max_concurrent: self.inner.max_concurrent,
            available_slots: self.inner.slots.available_permits(),
            ..RegistryStats::default()
        };
        for entry in jobs.values() {
            match entry.job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
            }
            if !entry.job.is_terminal() {
                stats.waiters += entry.job.waiters;
            }
        }
        stats
    }

    /// Stop admitting jobs. Leaders waiting for a slot fail as cancelled.
    pub fn close(&self) {
        self.inner.slots.close();
    }
}
