#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]
//! Shared helpers for integration tests.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use axum::response::Response;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Send a request through a router.
pub async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("failed to send request")
}

/// Read a response body to a string.
pub async fn body_string(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Find a Set-Cookie for `name` and return it as a `name=value` pair.
pub fn cookie_pair(response: &Response, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|cookie| cookie.starts_with(&prefix))
        .and_then(|cookie| cookie.split(';').next())
        .map(str::to_string)
}

/// Read a header value as a string, defaulting to empty.
pub fn header_string(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
