//! Strata S3 - S3 API surface support
//!
//! XML document types, the S3 error document renderer, request-id
//! generation, and the gateway metrics collector.

pub mod error;
pub mod metrics;
pub mod xml;

pub use error::{s3_error_response, RequestIdGen};
pub use metrics::{S3Metrics, S3Operation};
