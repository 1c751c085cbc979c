//! Networked cache tier backed by Redis.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CacheBackend, CacheError};

/// Keys fetched per `SCAN` round when clearing a prefix.
const SCAN_BATCH: usize = 200;

/// Redis-backed cache tier.
///
/// The connection is established lazily and re-established on demand, so a
/// Redis that is down at startup is picked up as soon as it comes back.
pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Create a backend for `url` without connecting yet.
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Backend(format!("invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(self.op_timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))??;

        debug!("Connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Run one command with the operation timeout applied.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, op(conn)).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        }
    }
}

/// Millisecond TTL for `PSETEX`, which rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let key = key.to_string();
        let value: Option<Vec<u8>> = self
            .run(|mut conn| async move { conn.get(key).await })
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let millis = ttl_millis(ttl);
        self.run(|mut conn| async move { conn.pset_ex::<_, _, ()>(key, value.as_ref(), millis).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        let removed: usize = self
            .run(|mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let pattern = pattern.clone();
            let (next, keys): (u64, Vec<String>) = self
                .run(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let deleted: usize = self
                    .run(|mut conn| async move { conn.del(keys).await })
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let _: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
