//! Extraction inputs and outputs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CacheNamespace};

/// What an extraction produces for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A direct media URL the client can stream from.
    Streaming,
    /// A transcoded audio file stored locally.
    Audio,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Audio => "audio",
        }
    }

    /// Cache key under which artifacts of this kind are stored.
    ///
    /// Streaming URLs live in their own namespace; audio file references are
    /// stable and share the metadata namespace under an `audio:` prefix.
    pub fn cache_key(&self, resource_id: &str) -> CacheKey {
        match self {
            Self::Streaming => CacheKey::new(CacheNamespace::Streaming, resource_id),
            Self::Audio => CacheKey::new(CacheNamespace::Metadata, &format!("audio:{resource_id}")),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Self::Streaming),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// A request handed to an [`super::Extractor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub resource_id: String,
    pub kind: ArtifactKind,
}

impl ExtractionRequest {
    pub fn new(resource_id: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind,
        }
    }
}

/// Result of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub resource_id: String,
    pub kind: ArtifactKind,
    /// Media URL for streaming artifacts, file path for audio artifacts.
    pub location: String,
    /// Container or codec extension, e.g. `mp4` or `mp3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(request: &ExtractionRequest, location: impl Into<String>) -> Self {
        Self {
            resource_id: request.resource_id.clone(),
            kind: request.kind,
            location: location.into(),
            format: None,
            title: None,
            duration_secs: None,
            size_bytes: None,
            produced_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        self.kind.cache_key(&self.resource_id)
    }
}
