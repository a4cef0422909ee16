//! Content-type gating middleware.
//!
//! Each gate rejects requests whose Content-Type doesn't match the endpoint
//! family, with 406 by default. JSON, XML, and form gates compare the header
//! exactly; the multipart gate does a case-insensitive prefix match so the
//! boundary parameter doesn't defeat it.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Caller-supplied rejection response.
pub type FailFn = Arc<dyn Fn() -> Response + Send + Sync>;

/// Which content-type family a gate admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateKind {
    Json,
    Xml,
    Form,
    Multipart,
}

impl GateKind {
    fn matches(self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        match self {
            GateKind::Json => content_type == "application/json",
            GateKind::Xml => content_type == "application/xml" || content_type == "text/xml",
            GateKind::Form => {
                content_type == "application/x-www-form-urlencoded"
                    || content_type == "multipart/form-data"
            }
            GateKind::Multipart => content_type
                .trim()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data"),
        }
    }
}

/// A content-type gate with an optional custom rejection.
#[derive(Clone)]
pub struct ContentGate {
    kind: GateKind,
    on_fail: Option<FailFn>,
}

impl ContentGate {
    /// Admit only `application/json`.
    pub fn json() -> Self {
        Self {
            kind: GateKind::Json,
            on_fail: None,
        }
    }

    /// Admit only `application/xml` or `text/xml`.
    pub fn xml() -> Self {
        Self {
            kind: GateKind::Xml,
            on_fail: None,
        }
    }

    /// Admit only urlencoded or multipart form submissions.
    pub fn form() -> Self {
        Self {
            kind: GateKind::Form,
            on_fail: None,
        }
    }

    /// Admit only `multipart/form-data` (any boundary, any case).
    pub fn multipart() -> Self {
        Self {
            kind: GateKind::Multipart,
            on_fail: None,
        }
    }

    /// Replace the default 406 rejection.
    #[must_use]
    pub fn with_fail(mut self, on_fail: impl Fn() -> Response + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Arc::new(on_fail));
        self
    }
}

impl std::fmt::Debug for ContentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentGate")
            .field("kind", &self.kind)
            .field("on_fail", &self.on_fail.is_some())
            .finish()
    }
}

/// Content-type gating middleware.
pub async fn enforce(State(gate): State<ContentGate>, request: Request, next: Next) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    if !gate.kind.matches(content_type) {
        return match &gate.on_fail {
            Some(on_fail) => on_fail(),
            None => StatusCode::NOT_ACCEPTABLE.into_response(),
        };
    }

    next.run(request).await
}
