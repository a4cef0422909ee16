//! HTTP middleware helpers for axum.
//!
//! Building blocks that sit between the router and your handlers:
//!
//! - [`session`] — server-side sessions over a pluggable [`cache`] backend,
//!   carried by a cookie or a header
//! - [`csrf`] — token issuance and request gating for state-changing methods
//! - [`limit`] — fixed-window rate limiting with client-visible headers
//! - [`upload`] — multipart upload validation and conflict-safe persistence
//! - [`content`] — content-type gating for JSON/XML/form/multipart endpoints
//! - [`error`] — a typed HTTP error carrying call-site location and an
//!   optional request-body snapshot, plus a terminal reporting layer
//!
//! All middleware is plain `async fn` composed with
//! `axum::middleware::from_fn_with_state`; per-request state rides request
//! extensions and is recovered through typed extractors.

pub mod cache;
pub mod content;
pub mod csrf;
pub mod error;
pub mod limit;
pub mod session;
pub mod upload;

pub use cache::{CacheStore, MemoryStore, RateCounter, RedisStore};
pub use content::ContentGate;
pub use csrf::CsrfGate;
pub use error::{BodySnapshot, ErrorReporter, HttpError};
pub use limit::{RateLimitConfig, RateLimiter};
pub use session::{CookieOptions, SameSite, Session, SessionConfig, SessionManager};
pub use upload::{UploadConfig, UploadError, UploadedFile, Uploader};
