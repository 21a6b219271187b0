//! Strata Store - durable single-host object storage
//!
//! Objects live on a local filesystem as a payload file plus a
//! `<key>.meta.json` sidecar; writes go through a temp-file / fsync /
//! rename protocol so readers only ever observe complete objects.

mod store;

pub use store::{LocalStore, ObjectRead, META_SUFFIX};
