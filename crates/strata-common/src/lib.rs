//! Strata Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions, and utilities
//! used across all Strata components.

pub mod bufpool;
pub mod config;
pub mod error;
pub mod etag;
pub mod range;
pub mod types;

pub use bufpool::BufferPool;
pub use error::{Error, Result};
pub use range::ByteRange;
pub use types::*;
