//! S3 error document rendering and request-id generation

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use strata_common::Error;

/// Monotonic request-id source
///
/// Ids are the startup timestamp in nanoseconds plus a per-process counter,
/// so they sort in issue order and never repeat within a process.
pub struct RequestIdGen {
    epoch_nanos: u64,
    counter: AtomicU64,
}

impl RequestIdGen {
    #[must_use]
    pub fn new() -> Self {
        let epoch_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            epoch_nanos,
            counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016X}{:08X}", self.epoch_nanos, seq)
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the S3 `<Error>` document
#[must_use]
pub fn error_xml(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>{}</Code>
  <Message>{}</Message>
  <Resource>{}</Resource>
  <RequestId>{}</RequestId>
</Error>"#,
        escape_xml(code),
        escape_xml(message),
        escape_xml(resource),
        escape_xml(request_id)
    )
}

/// Build the error response for a failed S3 request
#[must_use]
pub fn s3_error_response(err: &Error, resource: &str, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = error_xml(err.s3_error_code(), &err.to_string(), resource, request_id);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/xml")
        .header("x-amz-request-id", request_id)
        .body(Body::from(body))
        .expect("static response construction")
}

/// Escape text for XML element content
///
/// Error messages embed bucket names and object keys, which may legally
/// contain `&`, `<`, and `>`.
#[must_use]
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
