//! Fixed-window counter over a cache store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::CacheStore;

/// One client's attempt counter within a fixed window.
///
/// The counter key lives in the backing store; this type only interprets it.
/// Atomic increment semantics are the store's promise.
#[derive(Clone)]
pub struct RateCounter {
    store: Arc<dyn CacheStore>,
    key: String,
    max_attempts: u32,
    window: Duration,
}

impl RateCounter {
    pub fn new(
        store: Arc<dyn CacheStore>,
        key: impl Into<String>,
        max_attempts: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            max_attempts,
            window,
        }
    }

    async fn count(&self) -> Result<i64> {
        Ok(self
            .store
            .get(&self.key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    /// Whether the window is exhausted.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.count().await? >= i64::from(self.max_attempts))
    }

    /// Consume one attempt. Returns the post-increment count.
    pub async fn hit(&self) -> Result<i64> {
        self.store.increment(&self.key, self.window).await
    }

    /// Attempts left in the current window.
    pub async fn retries_left(&self) -> Result<u32> {
        let count = self.count().await?;
        let left = i64::from(self.max_attempts) - count;
        Ok(u32::try_from(left.max(0)).unwrap_or(0))
    }

    /// How long until the window resets. Falls back to the full window when
    /// the store reports no expiry.
    pub async fn available_in(&self) -> Result<Duration> {
        Ok(self.store.ttl(&self.key).await?.unwrap_or(self.window))
    }
}

impl std::fmt::Debug for RateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateCounter")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .field("window", &self.window)
            .finish()
    }
}
