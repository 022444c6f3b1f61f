//! Distributed cache tier.
//!
//! Shared across gateway instances. The Redis store uses
//! `redis::aio::ConnectionManager` for multiplexed connections with
//! automatic reconnection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::CacheError;

/// A cache tier reachable over the network.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// Redis-backed distributed tier.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Connection(format!("invalid Redis URL: {e}")))?;
        let connection_manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(format!("failed to connect to Redis: {e}")))?;

        tracing::debug!("Redis cache tier connected");
        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl DistributedCache for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis GET failed: {e}")))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis SET failed: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
