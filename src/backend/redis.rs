//! Redis-backed credit store: one pipeline round trip per hit.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;

use super::{Backend, HitOutcome};
use crate::error::BoxError;

/// Shared counter store on a Redis instance.
///
/// Each hit runs a single pipeline so the count and TTL come back from one
/// atomic round trip:
///
/// ```text
/// SET    {prefix}{key} 0 NX EX {ttl}
/// INCR   {prefix}{key}
/// TTL    {prefix}{key}
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
}

impl RedisBackend {
    /// Create a backend from a `redis://` connection URL.
    pub fn new(url: &str) -> RedisResult<Self> {
        Ok(Self { client: redis::Client::open(url)?, prefix: "divvy:".to_string() })
    }

    /// Override the key prefix (default `divvy:`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn conn(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn initialize(&self) -> Result<(), BoxError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn hit(&self, key: &str, limit: u64, ttl_seconds: u64) -> Result<HitOutcome, BoxError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn().await?;

        // Redis rejects EX 0, and a zero-length window must not persist
        // anything anyway; one second is the shortest expiry it can hold.
        let expiry = ttl_seconds.max(1);

        let (count, ttl): (u64, i64) = redis::pipe()
            .cmd("SET")
            .arg(&redis_key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(expiry)
            .ignore()
            .cmd("INCR")
            .arg(&redis_key)
            .cmd("TTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        Ok(HitOutcome {
            is_allowed: count <= limit,
            current_credit: limit.saturating_sub(count) as i64,
            // TTL reports -1/-2 for keys without expiry; clamp to zero.
            next_reset_seconds: ttl.max(0),
        })
    }
}
