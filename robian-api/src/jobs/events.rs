//! Job state transition events.
//!
//! Published on a broadcast channel so a notification layer can push live
//! updates without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobKey, JobState};
use crate::error::ExtractionError;
use crate::extraction::ArtifactKind;

/// A job changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: Uuid,
        resource_id: String,
        kind: ArtifactKind,
        at: DateTime<Utc>,
    },
    Running {
        job_id: Uuid,
        resource_id: String,
        kind: ArtifactKind,
        at: DateTime<Utc>,
        /// Time spent waiting for a concurrency slot.
        queued_ms: u64,
    },
    Succeeded {
        job_id: Uuid,
        resource_id: String,
        kind: ArtifactKind,
        at: DateTime<Utc>,
        location: String,
    },
    Failed {
        job_id: Uuid,
        resource_id: String,
        kind: ArtifactKind,
        at: DateTime<Utc>,
        error: ExtractionError,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Queued { job_id, .. }
            | Self::Running { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn key(&self) -> JobKey {
        let (resource_id, kind) = match self {
            Self::Queued {
                resource_id, kind, ..
            }
            | Self::Running {
                resource_id, kind, ..
            }
            | Self::Succeeded {
                resource_id, kind, ..
            }
            | Self::Failed {
                resource_id, kind, ..
            } => (resource_id, kind),
        };
        JobKey::new(resource_id.clone(), *kind)
    }

    /// State the job entered.
    pub fn state(&self) -> JobState {
        match self {
            Self::Queued { .. } => JobState::Queued,
            Self::Running { .. } => JobState::Running,
            Self::Succeeded { .. } => JobState::Succeeded,
            Self::Failed { .. } => JobState::Failed,
        }
    }
}
