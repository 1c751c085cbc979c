//! Extraction job tracking: deduplication, concurrency ceiling, lifecycle
//! events and retention.

mod events;
mod job;
mod purge;
mod registry;

pub use events::JobEvent;
pub use job::{ExtractionJob, JobKey, JobState};
pub use purge::JobPurgeService;
pub use registry::{
    ExtractionJobRegistry, FollowerHandle, JobOutcome, JobRole, LeaderHandle, RegistryStats,
};
