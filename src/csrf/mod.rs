//! CSRF token issuance and request gating.
//!
//! Tokens live inside the session under a reserved key. The gating
//! middleware exempts RFC 9110 safe methods, extracts a candidate token from
//! header, cookie, or body field (in that order), and rejects mismatches
//! with 419. It must run after [`crate::session::attach`].
//!
//! A session that holds no token gets one minted (and mirrored to the
//! client) before the check runs — so that session's first state-changing
//! request cannot match and is rejected; the mirrored token only becomes
//! usable on the client's next request.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::HttpError;
use crate::session::Session;
use crate::session::middleware::{append_header, cookie_value};

/// Session key the token is stored under.
pub const CSRF_SESSION_KEY: &str = "csrf";

/// Request header checked for a candidate token; also the response header
/// the minted token is mirrored into.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Cookie and form/JSON field checked for a candidate token.
pub const CSRF_FIELD: &str = "csrf_token";

/// Status returned on validation failure.
const CSRF_FAILURE_STATUS: u16 = 419;

/// Caller-supplied rejection response.
pub type FailFn = Arc<dyn Fn() -> Response + Send + Sync>;

/// Caller-supplied predicate that bypasses the check entirely.
pub type SkipFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Read the session's current token, defaulting to empty.
pub fn token(session: &Session) -> String {
    session.get_as::<String>(CSRF_SESSION_KEY).unwrap_or_default()
}

/// Generate a new token and store it in the session.
///
/// The caller is responsible for getting the token back to the client
/// (render it into a form, or rely on the middleware's mirroring).
pub fn refresh(session: &Session) -> Result<String> {
    let token = generate_token();
    session
        .insert(CSRF_SESSION_KEY, &token)
        .context("failed to store CSRF token")?;
    Ok(token)
}

/// Random 32 bytes plus a timestamp, hashed and hex-encoded.
fn generate_token() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);

    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp().to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Configuration for the CSRF gate.
#[derive(Clone)]
pub struct CsrfGate {
    secure_cookie: bool,
    on_fail: Option<FailFn>,
    skip: Option<SkipFn>,
}

impl Default for CsrfGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrfGate {
    /// Gate with the default 419 rejection and a Secure mirrored cookie.
    pub fn new() -> Self {
        Self {
            secure_cookie: true,
            on_fail: None,
            skip: None,
        }
    }

    /// Drop the Secure attribute from the mirrored cookie (plain-HTTP dev
    /// setups).
    #[must_use]
    pub fn insecure_cookie(mut self) -> Self {
        self.secure_cookie = false;
        self
    }

    /// Replace the default rejection response.
    #[must_use]
    pub fn with_fail(mut self, on_fail: impl Fn() -> Response + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Arc::new(on_fail));
        self
    }

    /// Bypass the check for requests matching the predicate.
    #[must_use]
    pub fn with_skip(mut self, skip: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Some(Arc::new(skip));
        self
    }

    fn reject(&self) -> Response {
        match &self.on_fail {
            Some(on_fail) => on_fail(),
            None => {
                let status = StatusCode::from_u16(CSRF_FAILURE_STATUS)
                    .unwrap_or(StatusCode::FORBIDDEN);
                (status, "invalid csrf token").into_response()
            }
        }
    }
}

impl std::fmt::Debug for CsrfGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfGate")
            .field("secure_cookie", &self.secure_cookie)
            .field("on_fail", &self.on_fail.is_some())
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

/// CSRF gating middleware.
pub async fn enforce(
    State(gate): State<CsrfGate>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    if let Some(skip) = &gate.skip
        && skip(&request)
    {
        return Ok(next.run(request).await);
    }

    let session = request
        .extensions()
        .get::<Session>()
        .cloned()
        .ok_or_else(|| HttpError::new("session middleware not installed"))?;

    let mut stored = token(&session);
    let mut minted = None;
    if stored.is_empty() {
        stored = refresh(&session).map_err(HttpError::from)?;
        minted = Some(stored.clone());
    }

    let request = if requires_token(request.method()) {
        let (candidate, request) = candidate_token(request).await?;
        // An empty stored token can never be matched; rejecting keeps the
        // freshly minted token single-round-trip.
        if candidate.as_deref() != Some(stored.as_str()) {
            let mut response = gate.reject();
            advertise(&mut response);
            mirror(&mut response, minted.as_deref(), gate.secure_cookie);
            return Ok(response);
        }
        request
    } else {
        request
    };

    let mut response = next.run(request).await;
    advertise(&mut response);
    mirror(&mut response, minted.as_deref(), gate.secure_cookie);
    Ok(response)
}

/// State-changing methods require a token; RFC 9110 safe methods are exempt.
fn requires_token(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Extract the candidate token: header, then cookie, then body field.
///
/// Reading the body consumes it, so the request is rebuilt from the buffered
/// bytes before being handed back.
async fn candidate_token(request: Request) -> Result<(Option<String>, Request), HttpError> {
    if let Some(candidate) = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        let candidate = candidate.to_string();
        return Ok((Some(candidate), request));
    }

    if let Some(candidate) = cookie_value(request.headers(), CSRF_FIELD).filter(|v| !v.is_empty()) {
        return Ok((Some(candidate), request));
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| HttpError::new(format!("failed to buffer request body: {err}")))?;

    let candidate = if content_type.starts_with("application/json") {
        serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|value| value.get(CSRF_FIELD)?.as_str().map(str::to_string))
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        url::form_urlencoded::parse(&bytes)
            .find(|(key, _)| key == CSRF_FIELD)
            .map(|(_, value)| value.into_owned())
    } else {
        None
    };

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok((candidate.filter(|v| !v.is_empty()), request))
}

/// Allow cross-origin callers to read and send the token header.
fn advertise(response: &mut Response) {
    append_header(
        response,
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        "X-CSRF-TOKEN",
    );
    append_header(
        response,
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "X-CSRF-TOKEN",
    );
}

/// Mirror a freshly minted token into the response header and cookie.
fn mirror(response: &mut Response, minted: Option<&str>, secure: bool) {
    let Some(token) = minted else {
        return;
    };

    if let Ok(value) = HeaderValue::from_str(token) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(CSRF_HEADER), value);
    }

    // Session-scoped cookie: no Max-Age, readable by client script so the
    // token can be echoed back in a header.
    let mut cookie = format!("{CSRF_FIELD}={token}; Path=/; SameSite=Strict");
    if secure {
        cookie.push_str("; Secure");
    }
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_safe_methods_are_exempt() {
        assert!(!requires_token(&Method::GET));
        assert!(!requires_token(&Method::HEAD));
        assert!(!requires_token(&Method::OPTIONS));
        assert!(!requires_token(&Method::TRACE));
        assert!(requires_token(&Method::POST));
        assert!(requires_token(&Method::PUT));
        assert!(requires_token(&Method::PATCH));
        assert!(requires_token(&Method::DELETE));
    }

    #[tokio::test]
    async fn test_candidate_from_header_wins() {
        let request = Request::builder()
            .method(Method::POST)
            .header(CSRF_HEADER, "from-header")
            .header(header::COOKIE, format!("{CSRF_FIELD}=from-cookie"))
            .body(Body::empty())
            .unwrap();
        let (candidate, _request) = candidate_token(request).await.unwrap();
        assert_eq!(candidate.as_deref(), Some("from-header"));
    }

    #[tokio::test]
    async fn test_candidate_from_form_body_restores_request() {
        let request = Request::builder()
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("a=1&{CSRF_FIELD}=from-form")))
            .unwrap();
        let (candidate, request) = candidate_token(request).await.unwrap();
        assert_eq!(candidate.as_deref(), Some("from-form"));

        let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], format!("a=1&{CSRF_FIELD}=from-form").as_bytes());
    }

    #[tokio::test]
    async fn test_candidate_from_json_body() {
        let request = Request::builder()
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"{CSRF_FIELD}":"from-json"}}"#)))
            .unwrap();
        let (candidate, _request) = candidate_token(request).await.unwrap();
        assert_eq!(candidate.as_deref(), Some("from-json"));
    }
}
