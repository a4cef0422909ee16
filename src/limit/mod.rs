//! Fixed-window rate limiting middleware.
//!
//! Counter state lives in the cache backend; this layer only builds the
//! counter key, consults it, and reports the outcome through response
//! headers: `X-LIMIT-UNTIL` (remaining lock duration) on rejection and
//! `X-LIMIT-REMAIN` (attempts left) on every counted response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::cache::{CacheStore, RateCounter};
use crate::error::HttpError;
use crate::session::middleware::append_header;

/// Header carrying the remaining lock duration on rejected requests.
pub const LIMIT_UNTIL_HEADER: &str = "x-limit-until";

/// Header carrying the remaining allowance on counted requests.
pub const LIMIT_REMAIN_HEADER: &str = "x-limit-remain";

/// Caller-supplied rejection response, given the remaining lock duration.
pub type FailFn = Arc<dyn Fn(Duration) -> Response + Send + Sync>;

/// Caller-supplied predicate that bypasses the limiter.
pub type SkipFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Caller-supplied extra key fragments derived from the request.
pub type KeysFn = Arc<dyn Fn(&Request) -> Vec<String> + Send + Sync>;

/// Rate limit policy and hooks, with the stock defaults.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Base name of the counter key.
    pub key: String,
    /// Attempts allowed per window (default 100).
    pub max_attempts: u32,
    /// Window length (default 1 minute).
    pub window: Duration,
    /// Don't count requests whose response is an error.
    pub skip_on_error: bool,
    /// Custom rejection response.
    pub on_fail: Option<FailFn>,
    /// Bypass predicate.
    pub skip: Option<SkipFn>,
    /// Extra key fragments (e.g. the route, a user id).
    pub keys: Option<KeysFn>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key: "limiter".to_string(),
            max_attempts: 100,
            window: Duration::from_secs(60),
            skip_on_error: false,
            on_fail: None,
            skip: None,
            keys: None,
        }
    }
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .field("window", &self.window)
            .field("skip_on_error", &self.skip_on_error)
            .finish()
    }
}

/// Shared state for the rate limiting middleware.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Build the counter key for a request: base, client address, fragments.
    fn counter_key(&self, request: &Request) -> String {
        let mut key = format!("rate:{}:{}", self.config.key, client_ip(request));
        if let Some(keys) = &self.config.keys {
            for fragment in keys(request) {
                let fragment = fragment.trim();
                if !fragment.is_empty() {
                    key.push(':');
                    key.push_str(fragment);
                }
            }
        }
        key
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

/// Rate limiting middleware.
pub async fn enforce(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    if let Some(skip) = &limiter.config.skip
        && skip(&request)
    {
        return Ok(next.run(request).await);
    }

    let key = limiter.counter_key(&request);
    let counter = RateCounter::new(
        limiter.store.clone(),
        key.clone(),
        limiter.config.max_attempts,
        limiter.config.window,
    );

    if counter.is_locked().await.map_err(HttpError::from)? {
        let until = counter.available_in().await.map_err(HttpError::from)?;
        debug!(key = %key, until = ?until, "rate limit exceeded");

        let mut response = match &limiter.config.on_fail {
            Some(on_fail) => on_fail(until),
            None => StatusCode::TOO_MANY_REQUESTS.into_response(),
        };
        append_header(&mut response, header::ACCESS_CONTROL_EXPOSE_HEADERS, "X-LIMIT-UNTIL");
        if let Ok(value) = HeaderValue::from_str(&format_duration(until)) {
            response
                .headers_mut()
                .insert(header::HeaderName::from_static(LIMIT_UNTIL_HEADER), value);
        }
        return Ok(response);
    }

    let mut response = next.run(request).await;

    let errored = response.status().is_client_error() || response.status().is_server_error();
    if !limiter.config.skip_on_error || !errored {
        counter.hit().await.map_err(HttpError::from)?;
    }

    let left = counter.retries_left().await.map_err(HttpError::from)?;
    append_header(&mut response, header::ACCESS_CONTROL_EXPOSE_HEADERS, "X-LIMIT-REMAIN");
    if let Ok(value) = HeaderValue::from_str(&left.to_string()) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(LIMIT_REMAIN_HEADER), value);
    }

    Ok(response)
}

/// Resolve the client address: forwarded headers first, then the socket.
pub fn client_ip(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(ip) = value.split(',').next()
    {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return value.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Render a duration compactly for the lock header: `1h2m3s`, `45s`.
fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}
