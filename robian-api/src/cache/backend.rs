//! Uniform contract implemented by every cache tier.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors raised by a cache backend.
///
/// These never escape [`super::TieredCache`]; they only decide whether the
/// primary tier is considered down.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("unknown cache namespace: {0}")]
    InvalidNamespace(String),
}

impl CacheError {
    /// Whether the error means the backend cannot be reached right now.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// A key/value store with per-entry expiry.
///
/// Keys are fully qualified (`"{namespace}:{id}"`); writes replace the whole
/// value atomically.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// Fetch a live entry.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Create or replace an entry expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Remove an entry; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every entry whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), CacheError>;
}
