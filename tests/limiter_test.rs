#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Rate limiter tests: window exhaustion, headers, reset, hooks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Router, middleware};
use gatekit::{MemoryStore, RateLimitConfig, RateLimiter};

use common::{body_string, header_string, send};

fn router(config: RateLimitConfig) -> Router {
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), config);
    Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route("/boom", get(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
        }))
        .layer(middleware::from_fn_with_state(
            limiter,
            gatekit::limit::enforce,
        ))
}

fn request_from(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-real-ip", ip)
        .body(Body::empty())
        .expect("failed to build request")
}

#[tokio::test]
async fn test_allowance_counts_down_then_locks() {
    let app = router(RateLimitConfig {
        max_attempts: 3,
        ..RateLimitConfig::default()
    });

    for expected_remaining in ["2", "1", "0"] {
        let response = send(&app, request_from("/ok", "203.0.113.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_string(&response, "x-limit-remain"),
            expected_remaining
        );
    }

    let rejected = send(&app, request_from("/ok", "203.0.113.1")).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(!header_string(&rejected, "x-limit-until").is_empty());
    assert!(
        header_string(&rejected, "access-control-expose-headers").contains("X-LIMIT-UNTIL")
    );
    // Rejected requests are not counted, so no remaining-allowance header.
    assert_eq!(header_string(&rejected, "x-limit-remain"), "");
}

#[tokio::test]
async fn test_counter_resets_after_window() {
    let app = router(RateLimitConfig {
        max_attempts: 1,
        window: Duration::from_millis(100),
        ..RateLimitConfig::default()
    });

    let first = send(&app, request_from("/ok", "203.0.113.2")).await;
    assert_eq!(first.status(), StatusCode::OK);

    let locked = send(&app, request_from("/ok", "203.0.113.2")).await;
    assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let after = send(&app, request_from("/ok", "203.0.113.2")).await;
    assert_eq!(after.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_clients_get_separate_buckets() {
    let app = router(RateLimitConfig {
        max_attempts: 1,
        ..RateLimitConfig::default()
    });

    let first = send(&app, request_from("/ok", "203.0.113.3")).await;
    assert_eq!(first.status(), StatusCode::OK);

    let other = send(&app, request_from("/ok", "203.0.113.4")).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_skip_on_error_leaves_allowance_untouched() {
    let app = router(RateLimitConfig {
        max_attempts: 3,
        skip_on_error: true,
        ..RateLimitConfig::default()
    });

    for _ in 0..2 {
        let response = send(&app, request_from("/boom", "203.0.113.5")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header_string(&response, "x-limit-remain"), "3");
    }

    let counted = send(&app, request_from("/ok", "203.0.113.5")).await;
    assert_eq!(header_string(&counted, "x-limit-remain"), "2");
}

#[tokio::test]
async fn test_custom_fail_handler_sees_lock_duration() {
    let app = router(RateLimitConfig {
        max_attempts: 1,
        on_fail: Some(Arc::new(|until: Duration| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("come back in {}s", until.as_secs()),
            )
                .into_response()
        })),
        ..RateLimitConfig::default()
    });

    send(&app, request_from("/ok", "203.0.113.6")).await;
    let rejected = send(&app, request_from("/ok", "203.0.113.6")).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_string(rejected).await.starts_with("come back in"));
}

#[tokio::test]
async fn test_skip_predicate_bypasses_limiter() {
    let app = router(RateLimitConfig {
        max_attempts: 1,
        skip: Some(Arc::new(|request: &axum::extract::Request| {
            request.uri().path() == "/ok"
        })),
        ..RateLimitConfig::default()
    });

    for _ in 0..5 {
        let response = send(&app, request_from("/ok", "203.0.113.7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_string(&response, "x-limit-remain"), "");
    }
}

#[tokio::test]
async fn test_key_fragments_split_buckets() {
    let app = router(RateLimitConfig {
        max_attempts: 1,
        keys: Some(Arc::new(|request: &axum::extract::Request| {
            vec![request.uri().path().to_string()]
        })),
        ..RateLimitConfig::default()
    });

    let ok = send(&app, request_from("/ok", "203.0.113.8")).await;
    assert_eq!(ok.status(), StatusCode::OK);

    // Same client, different path fragment: separate counter.
    let boom = send(&app, request_from("/boom", "203.0.113.8")).await;
    assert_eq!(boom.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let locked = send(&app, request_from("/ok", "203.0.113.8")).await;
    assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);
}
