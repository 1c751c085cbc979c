//! Tiered caching layer.
//!
//! A networked primary (Redis) backed by a bounded in-process LRU. Callers
//! only see [`TieredCache`]; backend failures never surface as errors.

mod backend;
mod key;
mod memory;
mod namespace;
mod remote;
mod tiered;

use std::sync::Arc;

use tracing::{info, warn};

pub use backend::{CacheBackend, CacheError};
pub use key::CacheKey;
pub use memory::MemoryBackend;
pub use namespace::{CacheNamespace, TtlPolicy};
pub use remote::RedisBackend;
pub use tiered::{CacheStats, TieredCache};

use crate::config::CacheConfig;

impl TieredCache {
    /// Build the cache described by `config`.
    ///
    /// An invalid Redis URL disables the primary tier instead of failing
    /// startup; the service stays usable on the memory tier alone.
    pub fn from_config(config: &CacheConfig) -> Self {
        let secondary = Arc::new(MemoryBackend::with_capacity(config.memory_capacity));

        let primary: Option<Arc<dyn CacheBackend>> = match config.redis_url.as_deref() {
            Some(url) => match RedisBackend::new(url, config.op_timeout) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!(error = %e, "Redis disabled, using memory cache only");
                    None
                }
            },
            None => {
                info!("Redis not configured, using memory cache only");
                None
            }
        };

        Self::new(primary, secondary, config.ttl, config.primary_retry_after)
    }
}
