//! Strata Placement - consistent hashing with virtual nodes
//!
//! Maps each object key onto a stable, ordered set of storage nodes. The
//! ring is built once at startup and is immutable afterwards; share it as
//! `Arc<HashRing>` across request tasks.

mod ring;

pub use ring::{HashRing, VIRTUAL_NODES};
