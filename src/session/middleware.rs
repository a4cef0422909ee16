//! Per-request session lifecycle middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::cache::CacheStore;
use crate::error::HttpError;

use super::config::{Carrier, CookieOptions, SessionConfig};
use super::entity::Session;

/// Shared state for the session middleware: the backing store plus config.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn CacheStore>,
    config: Arc<SessionConfig>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CacheStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish()
    }
}

/// Session middleware: resolve or create, expose downstream, save after.
///
/// The session handle rides request extensions; handlers extract it as a
/// `Session` parameter. Persistence is skipped when downstream produced a
/// typed error, since the bag may be half-mutated.
pub async fn attach(
    State(manager): State<SessionManager>,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let carried = carried_id(&manager.config.carrier, request.headers());
    let session = Session::new(manager.store.clone(), manager.config.clone(), carried.clone());

    let found = session.load().await.map_err(HttpError::from)?;
    if !found {
        session.fresh().await.map_err(HttpError::from)?;
    }

    request.extensions_mut().insert(session.clone());
    let mut response = next.run(request).await;

    if response.extensions().get::<HttpError>().is_none() {
        session.save().await.map_err(HttpError::from)?;
    }

    let id = session.id();
    let issued = !id.is_empty() && carried.as_deref() != Some(id.as_str());
    match &manager.config.carrier {
        Carrier::Header { name } => {
            // Cross-origin callers must be allowed to read and send the
            // carrier header.
            append_header(&mut response, header::ACCESS_CONTROL_EXPOSE_HEADERS, name);
            append_header(&mut response, header::ACCESS_CONTROL_ALLOW_HEADERS, name);
            if issued && let Ok(value) = HeaderValue::from_str(&id) {
                if let Ok(name) = name.parse::<header::HeaderName>() {
                    response.headers_mut().insert(name, value);
                }
            }
        }
        Carrier::Cookie { name, options } => {
            if issued {
                let cookie = format_set_cookie(name, &id, options, manager.config.ttl);
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        response.headers_mut().append(header::SET_COOKIE, value);
                    }
                    Err(err) => warn!(error = %err, "failed to encode session cookie"),
                }
            }
        }
    }

    Ok(response)
}

/// Extract the session identifier a request carries.
fn carried_id(carrier: &Carrier, headers: &HeaderMap) -> Option<String> {
    let id = match carrier {
        Carrier::Header { name } => headers.get(name)?.to_str().ok()?.to_string(),
        Carrier::Cookie { name, .. } => cookie_value(headers, name)?,
    };
    if id.is_empty() { None } else { Some(id) }
}

/// Read a cookie from the request's Cookie header.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// Render a Set-Cookie value from the configured attributes.
pub(crate) fn format_set_cookie(
    name: &str,
    value: &str,
    options: &CookieOptions,
    ttl: Duration,
) -> String {
    let mut cookie = format!("{name}={value}; Path={}", options.path);

    let max_age = options.max_age.unwrap_or(ttl.as_secs());
    cookie.push_str(&format!("; Max-Age={max_age}"));

    if let Some(domain) = &options.domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(options.same_site.as_str());
    if options.secure {
        cookie.push_str("; Secure");
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

/// Append a value to a (possibly repeated) response header.
pub(crate) fn append_header(
    response: &mut Response,
    name: header::HeaderName,
    value: &str,
) -> bool {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response.headers_mut().append(name, value);
            true
        }
        Err(_) => false,
    }
}
