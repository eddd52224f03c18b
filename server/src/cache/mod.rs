//! Redis-backed presence/token cache.
//!
//! Holds the per-user refresh-token identifier that arbitrates
//! single-active-session, plus short-TTL read-through JSON caches for
//! read-heavy data on the delivery path. Cache failures on the read path
//! degrade to the fallback and are logged, never surfaced to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Redis key prefix for the per-user refresh-token identifier:
/// auth:token:{user_id}
const TOKEN_KEY_PREFIX: &str = "auth:token:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Authoritative single-key store for the "currently valid" refresh-token
/// identifier per user. Writes overwrite, never merge; the overwrite is the
/// eviction mechanism for other devices' refresh capability.
#[async_trait]
pub trait TokenIdentityStore: Send + Sync {
    async fn put_identity(
        &self,
        user_id: &str,
        token_id: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn identity(&self, user_id: &str) -> Result<Option<String>, CacheError>;
}

/// Generic string-value cache with TTL writes and pattern invalidation.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key matching a Redis glob pattern; returns how many went.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// Redis client wrapper for the shared presence/token cache.
#[derive(Clone)]
pub struct PresenceCache {
    client: redis::Client,
}

impl PresenceCache {
    pub fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Round-trip check used at start-up so misconfiguration fails the boot
    /// instead of the first login.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub fn token_key(user_id: &str) -> String {
        format!("{}{}", TOKEN_KEY_PREFIX, user_id)
    }
}

#[async_trait]
impl TokenIdentityStore for PresenceCache {
    async fn put_identity(
        &self,
        user_id: &str,
        token_id: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let key = Self::token_key(user_id);
        conn.set_ex::<_, _, ()>(&key, token_id, ttl.as_secs()).await?;
        Ok(())
    }

    async fn identity(&self, user_id: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let key = Self::token_key(user_id);
        let value: Option<String> = conn.get(&key).await?;
        Ok(value)
    }
}

#[async_trait]
impl ObjectCache for PresenceCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }
}

/// Read-through helper: a hit returns the cached value, a miss runs the
/// fallback and schedules a background write-back. Cache infrastructure
/// failures fall back with a warning; only the fallback's own error reaches
/// the caller.
pub async fn get_with_fallback<T, F, Fut, E>(
    cache: &Arc<dyn ObjectCache>,
    key: &str,
    ttl: Duration,
    fallback: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match cache.get_raw(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Cache read failed, using fallback");
        }
    }

    let value = fallback().await?;
    match serde_json::to_string(&value) {
        Ok(raw) => spawn_write_back(cache.clone(), key.to_string(), raw, ttl),
        Err(e) => tracing::warn!(key = %key, error = %e, "Skipping write-back of unserializable value"),
    }
    Ok(value)
}

/// Fire-and-forget cache population. Must never block the response path;
/// failures are logged, not surfaced.
pub fn spawn_write_back(cache: Arc<dyn ObjectCache>, key: String, raw: String, ttl: Duration) {
    tokio::spawn(async move {
        if let Err(e) = cache.set_raw(&key, &raw, ttl).await {
            tracing::warn!(key = %key, error = %e, "Cache write-back failed");
        }
    });
}

/// Fire-and-forget pattern invalidation, same contract as write-back.
pub fn spawn_invalidate(cache: Arc<dyn ObjectCache>, pattern: String) {
    tokio::spawn(async move {
        match cache.invalidate_pattern(&pattern).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(pattern = %pattern, removed, "Invalidated cache entries");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Cache invalidation failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_key_format() {
        assert_eq!(PresenceCache::token_key("U001"), "auth:token:U001");
    }
}
