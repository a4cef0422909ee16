//! Redis-backed cache store.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};

use super::CacheStore;

/// Cache store over a shared Redis client.
///
/// Counter arming uses a Lua script so INCR and EXPIRE are one atomic step;
/// a crash between the two would otherwise leave an immortal counter.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Connect from a Redis URL.
    pub fn open(url: &str) -> Result<Self> {
        let client = RedisClient::open(url).context("failed to parse Redis URL")?;
        Ok(Self::new(client))
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("failed to get Redis connection")
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await.context("EXISTS failed")?;
        Ok(exists)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.context("GET failed")?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, secs)
                    .await
                    .context("SETEX failed")?;
            }
            None => {
                conn.set::<_, _, ()>(key, value)
                    .await
                    .context("SET failed")?;
            }
        }
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        // SET XX KEEPTTL: only rewrite existing keys, keep their expiry.
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .context("SET XX KEEPTTL failed")?;
        Ok(written.is_some())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.context("DEL failed")?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        // -2 = absent, -1 = no expiry.
        let secs: i64 = conn.ttl(key).await.context("TTL failed")?;
        if secs < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(secs as u64)))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.conn().await?;

        let script = redis::Script::new(
            r"local count = redis.call('INCR', KEYS[1])
              if count == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
              end
              return count",
        );

        let count: i64 = script
            .key(key)
            .arg(window.as_secs().max(1) as i64)
            .invoke_async(&mut conn)
            .await
            .context("counter INCR failed")?;

        Ok(count)
    }

    async fn enqueue(&self, queue: &str, item: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.rpush::<_, _, ()>(queue, item)
            .await
            .context("RPUSH failed")?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let item: Option<String> = conn.lpop(queue, None).await.context("LPOP failed")?;
        Ok(item)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish()
    }
}
