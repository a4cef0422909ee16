//! The session entity: a JSON bag with lazy load and write-back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::CacheStore;
use crate::error::HttpError;

use super::config::SessionConfig;

/// Reserved key holding the session's RFC3339 creation timestamp.
pub(crate) const CREATED_AT_KEY: &str = "created_at";

/// Pending TTL adjustment, applied once at save time.
///
/// Extending and overriding are mutually exclusive; whichever was requested
/// last wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtlChange {
    Keep,
    Extend(Duration),
    Override(Duration),
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    data: BTreeMap<String, Value>,
    fresh: bool,
    modified: bool,
    ttl: TtlChange,
}

/// A cloneable handle to one request's session.
///
/// Map operations are synchronous and guarded by an interior lock; only
/// [`load`](Session::load), [`save`](Session::save),
/// [`fresh`](Session::fresh), and [`destroy`](Session::destroy) touch the
/// backing store. Sessions are not shared across requests, so the lock only
/// matters when a handler fans out internally.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn CacheStore>,
    config: Arc<SessionConfig>,
    inner: Arc<RwLock<SessionInner>>,
}

impl Session {
    /// Create a handle for the given carried identifier (None when the
    /// request carried no session).
    pub fn new(
        store: Arc<dyn CacheStore>,
        config: Arc<SessionConfig>,
        id: Option<String>,
    ) -> Self {
        Self {
            store,
            config,
            inner: Arc::new(RwLock::new(SessionInner {
                id: id.unwrap_or_default(),
                data: BTreeMap::new(),
                fresh: false,
                modified: false,
                ttl: TtlChange::Keep,
            })),
        }
    }

    /// The session identifier; empty for destroyed sessions.
    pub fn id(&self) -> String {
        self.inner.read().id.clone()
    }

    fn cache_key(id: &str) -> String {
        format!("sess:{id}")
    }

    /// Store a value. Keys are trimmed; empty keys are ignored.
    pub fn insert(&self, key: &str, value: impl Serialize) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(());
        }
        let value = serde_json::to_value(value).context("failed to encode session value")?;

        let mut inner = self.inner.write();
        inner.data.insert(key.to_string(), value);
        inner.modified = true;
        Ok(())
    }

    /// Fetch a raw value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().data.get(key).cloned()
    }

    /// Fetch and decode a value; type mismatches read as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.write();
        inner.data.remove(key);
        inner.modified = true;
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().data.contains_key(key)
    }

    /// When the session was created, per its reserved timestamp field.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.get_as::<String>(CREATED_AT_KEY)?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Schedule a TTL extension, applied at save time. Zero is ignored.
    pub fn add_ttl(&self, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.write();
        inner.ttl = TtlChange::Extend(ttl);
        inner.modified = true;
    }

    /// Schedule an absolute TTL override, applied at save time. Zero is
    /// ignored.
    pub fn set_ttl(&self, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.write();
        inner.ttl = TtlChange::Override(ttl);
        inner.modified = true;
    }

    /// Remove the backing entry and clear in-memory state.
    pub async fn destroy(&self) -> Result<()> {
        let id = self.id();
        if id.is_empty() {
            return Ok(());
        }

        self.store.forget(&Self::cache_key(&id)).await?;

        let mut inner = self.inner.write();
        inner.id.clear();
        inner.data.clear();
        Ok(())
    }

    /// Persist the session if fresh or modified.
    ///
    /// Fresh sessions write with the configured default TTL; otherwise the
    /// pending TTL change applies. A successful save clears the flags, so
    /// repeated saves without intervening mutation write nothing.
    pub async fn save(&self) -> Result<()> {
        let (id, fresh, ttl, encoded) = {
            let inner = self.inner.read();
            if inner.id.is_empty() || (!inner.fresh && !inner.modified) {
                return Ok(());
            }
            let encoded =
                serde_json::to_string(&inner.data).context("failed to encode session data")?;
            (inner.id.clone(), inner.fresh, inner.ttl, encoded)
        };

        let key = Self::cache_key(&id);
        if fresh {
            self.store
                .put(&key, &encoded, Some(self.config.ttl))
                .await?;
        } else {
            match ttl {
                TtlChange::Extend(delta) => {
                    let ttl = match self.store.ttl(&key).await? {
                        Some(remaining) => remaining + delta,
                        None => delta,
                    };
                    self.store.put(&key, &encoded, Some(ttl)).await?;
                }
                TtlChange::Override(ttl) => {
                    self.store.put(&key, &encoded, Some(ttl)).await?;
                }
                TtlChange::Keep => {
                    // Preserves the entry's remaining TTL; a vanished entry
                    // stays vanished rather than resurrecting without expiry.
                    self.store.update(&key, &encoded).await?;
                }
            }
        }

        let mut inner = self.inner.write();
        inner.fresh = false;
        inner.modified = false;
        inner.ttl = TtlChange::Keep;
        Ok(())
    }

    /// Fetch and decode the backing entry.
    ///
    /// Returns false when the session has no identifier or the entry is
    /// absent.
    pub async fn load(&self) -> Result<bool> {
        let id = self.id();
        if id.is_empty() {
            return Ok(false);
        }

        let key = Self::cache_key(&id);
        if !self.store.exists(&key).await? {
            return Ok(false);
        }
        let Some(encoded) = self.store.get(&key).await? else {
            return Ok(false);
        };

        let data: BTreeMap<String, Value> =
            serde_json::from_str(&encoded).context("failed to decode session data")?;

        self.inner.write().data = data;
        Ok(true)
    }

    /// Evict any existing backing entry and start a new session: new
    /// identifier, empty bag, creation timestamp.
    pub async fn fresh(&self) -> Result<()> {
        let old_id = self.id();
        if !old_id.is_empty() {
            self.store.forget(&Self::cache_key(&old_id)).await?;
        }

        let id = (self.config.generator)();

        let mut inner = self.inner.write();
        inner.id = id;
        inner.data.clear();
        inner.fresh = true;
        inner.modified = true;
        inner.ttl = TtlChange::Keep;
        inner.data.insert(
            CREATED_AT_KEY.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Session")
            .field("id", &inner.id)
            .field("fresh", &inner.fresh)
            .field("modified", &inner.modified)
            .finish()
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| HttpError::new("session middleware not installed"))
    }
}
