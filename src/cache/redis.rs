//! Redis-backed cache for shared response storage across workers.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CacheBackend, CacheError};

/// Key prefix for cache entries in Redis.
const KEY_PREFIX: &str = "shelfcrawl:cache:";

/// Redis-backed cache entry store.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
}

impl RedisCacheBackend {
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Unavailable(format!("Redis connection error: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable(format!("Redis connection manager error: {}", e)))?;
        Ok(Self { conn })
    }

    fn entry_key(fingerprint: &str) -> String {
        format!("{}{}", KEY_PREFIX, fingerprint)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn close(&self) -> Result<(), CacheError> {
        // ConnectionManager reconnects on demand; nothing to tear down.
        Ok(())
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn
            .get(Self::entry_key(fingerprint))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(raw)
    }

    async fn put(
        &self,
        fingerprint: &str,
        entry: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = Self::entry_key(fingerprint);
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, entry, ttl.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, entry)
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
        }
    }
}
