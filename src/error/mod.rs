//! Typed HTTP errors with call-site capture and request-body snapshots.
//!
//! [`HttpError`] is the error currency of the crate: handlers and middleware
//! return it, axum renders it through its [`IntoResponse`] impl, and the
//! [`reporter`] layer recovers it at the top of the stack for structured
//! logging and custom rendering.

pub mod reporter;

use std::collections::BTreeMap;
use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::upload::UploadedFile;

pub use reporter::ErrorReporter;

/// An HTTP error with the context the terminal reporter needs.
///
/// Construction captures the caller's file and line, so errors point at the
/// place they were raised rather than at shared plumbing. The location and
/// body snapshot are logged, never rendered to the client.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HttpError {
    /// HTTP status sent to the client.
    pub status: StatusCode,
    /// Human-readable message; doubles as the default response body.
    pub message: String,
    /// Source file of the raising call site (empty for opaque errors).
    pub file: &'static str,
    /// Source line of the raising call site (0 for opaque errors).
    pub line: u32,
    /// Optional snapshot of the offending request body.
    pub body: Option<BodySnapshot>,
}

impl HttpError {
    /// Create a 500 error with the given message.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            file: caller.file(),
            line: caller.line(),
            body: None,
        }
    }

    /// Create an error with an explicit status.
    #[track_caller]
    pub fn with_status(message: impl Into<String>, status: StatusCode) -> Self {
        let caller = Location::caller();
        Self {
            status,
            message: message.into(),
            file: caller.file(),
            line: caller.line(),
            body: None,
        }
    }

    /// Attach a request-body snapshot for diagnostics.
    pub fn body(mut self, snapshot: BodySnapshot) -> Self {
        self.body = Some(snapshot);
        self
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        // Opaque errors map to a bare 500; the detail is logged here since
        // the client-facing message drops it.
        tracing::error!(error = ?err, "unhandled internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal Server Error".to_string(),
            file: "",
            line: 0,
            body: None,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.message.clone()).into_response();
        // The reporter layer recovers the full error from here.
        response.extensions_mut().insert(self);
        response
    }
}

/// Flattened view of a request body, for error diagnostics.
///
/// Form fields land under `form.<name>`, uploaded files under `file.<name>`
/// as `filename [size] (sniffed mime)` descriptors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodySnapshot {
    fields: BTreeMap<String, Value>,
}

impl BodySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a urlencoded body. Repeated fields collapse into an array.
    pub fn from_urlencoded(bytes: &[u8]) -> Self {
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(bytes) {
            grouped
                .entry(key.into_owned())
                .or_default()
                .push(Value::String(value.into_owned()));
        }

        let mut snapshot = Self::new();
        for (key, mut values) in grouped {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            snapshot.fields.insert(format!("form.{key}"), value);
        }
        snapshot
    }

    /// Snapshot a JSON body. Non-object bodies and parse failures are
    /// recorded under a single `form` key so the log still shows something.
    pub fn from_json(bytes: &[u8]) -> Self {
        let mut snapshot = Self::new();
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) if map.is_empty() => {
                snapshot.fields.insert("form".to_string(), Value::Null);
            }
            Ok(Value::Object(map)) => {
                for (key, value) in map {
                    snapshot.fields.insert(format!("form.{key}"), value);
                }
            }
            Ok(other) => {
                snapshot.fields.insert("form".to_string(), other);
            }
            Err(err) => {
                snapshot
                    .fields
                    .insert("form".to_string(), Value::String(err.to_string()));
            }
        }
        snapshot
    }

    /// Record a plain form field.
    pub fn record_field(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(format!("form.{name}"), value.into());
    }

    /// Record an uploaded file as a `filename [size] (mime)` descriptor.
    ///
    /// The MIME type is sniffed from content; unrecognized bytes show as `?`.
    pub fn record_file(&mut self, name: &str, file: &UploadedFile) {
        let size = bytesize::ByteSize::b(file.bytes.len() as u64);
        let mime = infer::get(&file.bytes).map_or("?", |t| t.mime_type());
        let name = &file.file_name;
        let descriptor = Value::String(format!("{name} [{size}] ({mime})"));

        let key = format!("file.{name}");
        match self.fields.get_mut(&key) {
            Some(Value::Array(entries)) => entries.push(descriptor),
            _ => {
                self.fields.insert(key, Value::Array(vec![descriptor]));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The flattened fields, for logging.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}
