//! Error types for Strata
//!
//! This module defines the common error type used throughout the system,
//! together with its mapping onto S3 error codes and HTTP statuses.

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
///
/// The type is `Clone` so that a single result can be handed to every
/// waiter of a coalesced request; I/O errors are captured as kind plus
/// message rather than carrying the source error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Storage errors
    #[error("i/o error: {0}")]
    Io(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    BadDigest { expected: String, actual: String },

    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    // Range errors
    #[error("invalid range: {0}")]
    InvalidRange(String),

    // Multipart upload errors
    #[error("no such upload: {0}")]
    NoSuchUpload(String),

    #[error("invalid part: {part_number}")]
    InvalidPart { part_number: u32 },

    #[error("invalid part order")]
    InvalidPartOrder,

    // Request errors
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("malformed xml: {0}")]
    MalformedXml(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("access denied")]
    AccessDenied,

    #[error("rate limit exceeded")]
    SlowDown,

    // Cluster errors
    #[error("write quorum not met: {acked}/{required}")]
    QuorumNotMet { acked: usize, required: usize },

    #[error("insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("node request failed: {0}")]
    Node(String),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(format!("{} ({})", e, e.kind()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Create a not-found error for an object
    pub fn no_such_key(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NoSuchKey {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a node-communication error
    pub fn node(msg: impl Into<String>) -> Self {
        Self::Node(msg.into())
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchKey { .. } | Self::NoSuchUpload(_))
    }

    /// Get the HTTP status code for S3 API compatibility
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::BadDigest { .. }
            | Self::InvalidPart { .. }
            | Self::InvalidPartOrder
            | Self::InvalidUri(_)
            | Self::MalformedXml(_) => 400,

            // 403 Forbidden
            Self::AccessDenied => 403,

            // 404 Not Found
            Self::NoSuchKey { .. } | Self::NoSuchUpload(_) => 404,

            // 405 Method Not Allowed
            Self::MethodNotAllowed(_) => 405,

            // 416 Range Not Satisfiable
            Self::InvalidRange(_) => 416,

            // 503 Service Unavailable
            Self::SlowDown => 503,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::QuorumNotMet { .. }
            | Self::InsufficientShards { .. }
            | Self::ErasureCoding(_)
            | Self::NoNodesAvailable
            | Self::Node(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Get the S3 error code for API compatibility
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::BadDigest { .. } => "BadDigest",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::NoSuchUpload(_) => "NoSuchUpload",
            Self::InvalidPart { .. } => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::InvalidUri(_) => "InvalidURI",
            Self::MalformedXml(_) => "MalformedXML",
            Self::MethodNotAllowed(_) => "MethodNotAllowed",
            Self::AccessDenied => "AccessDenied",
            Self::SlowDown => "SlowDown",
            Self::InvalidRange(_) => "InvalidRange",
            _ => "InternalError",
        }
    }
}
