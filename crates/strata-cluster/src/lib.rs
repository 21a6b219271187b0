//! Strata Cluster - placement-aware durability coordinators
//!
//! The gateway talks to storage nodes through the [`Backend`] capability
//! trait. Three implementations exist: [`HttpNode`] (one node over HTTP),
//! [`Replicated`] (N/W/R quorum replication across the hash ring), and
//! [`EcCluster`] (k+m Reed-Solomon shards plus a manifest). Anti-entropy
//! repair passes reconcile replicas and shards in the background.

mod backend;
mod ec;
mod http;
mod repair;
mod replicate;

pub use backend::{Backend, GetObject};
pub use ec::EcCluster;
pub use http::HttpNode;
pub use repair::RepairStats;
pub use replicate::Replicated;
