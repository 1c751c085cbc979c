//! Extraction job snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExtractionError;
use crate::extraction::{Artifact, ArtifactKind};

/// Identity of a job: one producer at a time per resource and artifact kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub resource_id: String,
    pub kind: ArtifactKind,
}

impl JobKey {
    pub fn new(resource_id: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource_id)
    }
}

/// Lifecycle state of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a job, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub job_id: Uuid,
    pub resource_id: String,
    pub kind: ArtifactKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only once the job succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Artifact>,
    /// Set only once the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractionError>,
    /// Callers currently joined to this job besides its leader.
    pub waiters: usize,
}

impl ExtractionJob {
    pub(crate) fn queued(key: &JobKey) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            resource_id: key.resource_id.clone(),
            kind: key.kind,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            waiters: 0,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.resource_id.clone(), self.kind)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
