//! Application-wide error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Outcome errors of an extraction job.
///
/// These are fanned out to every caller joined to the same job, so they are
/// cheap to clone and carry only strings.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    /// The external tool failed or returned unusable output.
    #[error("extraction failed for {resource_id}: {reason}")]
    Failed { resource_id: String, reason: String },

    /// The extraction exceeded the configured hard ceiling.
    #[error("extraction of {resource_id} timed out after {timeout_secs}s")]
    Timeout {
        resource_id: String,
        timeout_secs: u64,
    },

    /// The leader driving the job went away before it finished.
    #[error("extraction of {resource_id} was cancelled")]
    Cancelled { resource_id: String },

    /// No concurrency slot became free within the maximum queue wait.
    #[error("no extraction slot for {resource_id} within {waited_secs}s")]
    CapacityExceeded {
        resource_id: String,
        waited_secs: u64,
    },

    /// Registry bookkeeping went wrong; indicates a bug.
    #[error("registry invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

impl ExtractionError {
    pub fn failed(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvariantViolation { .. })
    }

    /// Stable machine-readable code, also used as the log/event label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "EXTRACTION_FAILED",
            Self::Timeout { .. } => "EXTRACTION_TIMEOUT",
            Self::Cancelled { .. } => "EXTRACTION_CANCELLED",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::InvariantViolation { .. } => "INTERNAL_ERROR",
        }
    }
}
