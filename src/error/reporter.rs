//! Terminal error reporting middleware.
//!
//! Sits at the top of the middleware stack, recovers the [`HttpError`] a
//! downstream layer attached to the response, logs watched statuses with
//! structured fields, and optionally swaps in a caller-rendered response.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use tracing::error;

use crate::limit::client_ip;

use super::HttpError;

/// Caller-supplied renderer for the final error response.
pub type RenderFn = Arc<dyn Fn(&HttpError) -> Response + Send + Sync>;

/// Configuration for the terminal error reporter.
///
/// Install with `axum::middleware::from_fn_with_state(reporter, error::reporter::report)`
/// as the outermost layer so every error passes through it exactly once.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    watch: Vec<u16>,
    render: Option<RenderFn>,
}

impl ErrorReporter {
    /// Reporter that logs every error status and renders the default
    /// plain-text body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict logging to the given status codes. An empty list logs all.
    #[must_use]
    pub fn watch(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.watch = statuses.into_iter().collect();
        self
    }

    /// Replace the default plain-text rendering with a custom response.
    #[must_use]
    pub fn render(mut self, render: impl Fn(&HttpError) -> Response + Send + Sync + 'static) -> Self {
        self.render = Some(Arc::new(render));
        self
    }

    fn watched(&self, status: StatusCode) -> bool {
        self.watch.is_empty() || self.watch.contains(&status.as_u16())
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("watch", &self.watch)
            .field("render", &self.render.is_some())
            .finish()
    }
}

/// Report middleware: log terminal errors and render the final response.
pub async fn report(
    State(reporter): State<ErrorReporter>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    let path = request.uri().path().to_string();
    let method = request.method().to_string();

    let response = next.run(request).await;

    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return response;
    }

    // Typed errors travel in response extensions; anything else is a bare
    // framework status and gets a synthesized error with no location.
    let err = response
        .extensions()
        .get::<HttpError>()
        .cloned()
        .unwrap_or_else(|| HttpError {
            status,
            message: status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
            file: "",
            line: 0,
            body: None,
        });

    if reporter.watched(status) {
        // tracing fields are static, so the flattened body snapshot is
        // rendered as a single JSON field.
        let body = err
            .body
            .as_ref()
            .filter(|snapshot| !snapshot.is_empty())
            .and_then(|snapshot| serde_json::to_string(snapshot.fields()).ok());
        error!(
            file = err.file,
            line = err.line,
            status = status.as_u16(),
            ip = %ip,
            path = %path,
            method = %method,
            body = body.as_deref().unwrap_or(""),
            "{}",
            err.message,
        );
    }

    match &reporter.render {
        Some(render) => render(&err),
        None => response,
    }
}
