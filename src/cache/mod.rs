//! Cache backends consumed by the session, rate-limit, and upload helpers.
//!
//! The crate never implements expiry or atomicity itself: both are promises
//! of the backing store. [`RedisStore`] is the production backend;
//! [`MemoryStore`] covers tests and single-process deployments.

mod counter;
mod memory;
mod redis_store;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use counter::RateCounter;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Key-value store with per-entry TTL, an atomic windowed counter, and a
/// small FIFO queue for deferred work.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, with an optional expiry.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Rewrite an existing value, preserving its remaining TTL.
    ///
    /// Returns false (without writing) when the key is absent.
    async fn update(&self, key: &str, value: &str) -> Result<bool>;

    /// Remove a key. Removing an absent key is not an error.
    async fn forget(&self, key: &str) -> Result<()>;

    /// Remaining TTL, or None when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Atomically increment a counter, arming `window` as its TTL when the
    /// counter is created. Returns the post-increment count.
    async fn increment(&self, key: &str, window: Duration) -> Result<i64>;

    /// Append an item to a named queue.
    async fn enqueue(&self, queue: &str, item: &str) -> Result<()>;

    /// Pop the oldest item from a named queue.
    async fn dequeue(&self, queue: &str) -> Result<Option<String>>;
}
