//! In-process cache store for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::CacheStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Dashmap-backed store with lazy expiry.
///
/// Expired entries are dropped on access rather than by a sweeper, which is
/// enough for the deterministic TTL behavior tests rely on. Counter atomicity
/// comes from the map's per-entry locking.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry, evicting it if expired.
    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key).map(|guard| guard.value().clone())?;
        if entry.expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.expired() => {
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: Some(Instant::now() + window),
            });

        // A dead counter restarts the window, as a fresh INCR would.
        if entry.expired() {
            entry.value = "0".to_string();
            entry.expires_at = Some(Instant::now() + window);
        }

        let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn enqueue(&self, queue: &str, item: &str) -> Result<()> {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(item.to_string());
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_forget() {
        let store = MemoryStore::new();
        store.put("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        store.forget("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_gone() {
        let store = MemoryStore::new();
        store
            .put("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_preserves_ttl_and_skips_absent() {
        let store = MemoryStore::new();
        assert!(!store.update("missing", "v").await.unwrap());

        store
            .put("k", "v1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.update("k", "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(store.ttl("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_increment_arms_window_once() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.increment("c", window).await.unwrap(), 1);
        assert_eq!(store.increment("c", window).await.unwrap(), 2);
        assert_eq!(store.increment("c", window).await.unwrap(), 3);
        assert!(store.ttl("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_increment_resets_after_window() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(10);
        assert_eq!(store.increment("c", window).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.increment("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let store = MemoryStore::new();
        store.enqueue("q", "a").await.unwrap();
        store.enqueue("q", "b").await.unwrap();
        assert_eq!(store.dequeue("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.dequeue("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.dequeue("q").await.unwrap(), None);
    }
}
