//! Cache namespaces and their expiration policy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Logical grouping of cache keys sharing a TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheNamespace {
    /// Debate listings and details; volatile.
    Debates,
    /// Resolved streaming URLs.
    Streaming,
    /// Stable metadata, including extracted audio file references.
    Metadata,
    /// Search results.
    Search,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 4] = [
        Self::Debates,
        Self::Streaming,
        Self::Metadata,
        Self::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debates => "debates",
            Self::Streaming => "streaming",
            Self::Metadata => "metadata",
            Self::Search => "search",
        }
    }

    /// Key prefix shared by every entry of this namespace.
    pub fn prefix(&self) -> String {
        format!("{}:", self.as_str())
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheNamespace {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| CacheError::InvalidNamespace(s.to_string()))
    }
}

/// Default TTL per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// Fallback for callers that cache outside the fixed namespaces.
    pub default: Duration,
    pub debates: Duration,
    pub streaming: Duration,
    pub metadata: Duration,
    pub search: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(300),
            debates: Duration::from_secs(300),
            streaming: Duration::from_secs(3600),
            metadata: Duration::from_secs(86400),
            search: Duration::from_secs(300),
        }
    }
}

impl TtlPolicy {
    pub fn for_namespace(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::Debates => self.debates,
            CacheNamespace::Streaming => self.streaming,
            CacheNamespace::Metadata => self.metadata,
            CacheNamespace::Search => self.search,
        }
    }
}
