//! Configuration types for Strata
//!
//! Plain structures filled in from the command line by the binary; defaults
//! match the flag defaults of the two roles.

use crate::types::{EcParams, ReplicationParams, StoragePolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Storage-node configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Listen address
    pub listen: String,
    /// Data directory this node exclusively owns
    pub data_dir: PathBuf,
    /// Shared-secret bearer token required from the gateway (empty = open)
    pub auth_token: Option<String>,
    /// Max request body size in bytes
    pub max_body: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            auth_token: None,
            max_body: 5000 * 1024 * 1024,
        }
    }
}

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: String,
    /// Node base URLs, in placement order for erasure coding
    pub nodes: Vec<String>,
    /// Durability policy
    pub storage_policy: StoragePolicy,
    /// Replication parameters (used when policy is replication)
    pub replication: ReplicationParams,
    /// Erasure-coding parameters (used when policy is ec)
    pub ec: EcParams,
    /// Bearer token presented to backend nodes
    pub backend_auth_token: Option<String>,
    /// Bearer token required from clients (empty = open)
    pub auth_token: Option<String>,
    /// Scratch directory for multipart staging and EC encoding
    pub scratch_dir: PathBuf,
    /// Max request body size in bytes
    pub max_body: usize,
    pub repair: RepairConfig,
    pub multipart: MultipartConfig,
    pub cache: CacheConfig,
    pub limiter: LimiterConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            nodes: Vec::new(),
            storage_policy: StoragePolicy::Replication,
            replication: ReplicationParams::default(),
            ec: EcParams::default(),
            backend_auth_token: None,
            auth_token: None,
            scratch_dir: PathBuf::from("/tmp"),
            max_body: 5000 * 1024 * 1024,
            repair: RepairConfig::default(),
            multipart: MultipartConfig::default(),
            cache: CacheConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}

/// Anti-entropy repair loop configuration
#[derive(Clone, Copy, Debug)]
pub struct RepairConfig {
    pub interval: Duration,
    /// Objects examined per repair cycle
    pub batch: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            batch: 100,
        }
    }
}

/// Multipart upload staging configuration
#[derive(Clone, Copy, Debug)]
pub struct MultipartConfig {
    /// Sweep cadence for stale uploads
    pub sweep_interval: Duration,
    /// Age after which an incomplete upload is removed
    pub ttl: Duration,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10 * 60),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Cache tier configuration
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Metadata cache budget in bytes
    pub metadata_bytes: u64,
    /// Small-object data cache budget in bytes
    pub data_bytes: u64,
    /// Largest object the data cache will hold
    pub max_object_bytes: u64,
    /// List/head result cache budget in bytes
    pub list_bytes: u64,
    pub ttl: Duration,
    pub list_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metadata_bytes: 128 * 1024 * 1024,
            data_bytes: 512 * 1024 * 1024,
            max_object_bytes: 256 * 1024,
            list_bytes: 64 * 1024 * 1024,
            ttl: Duration::from_secs(5 * 60),
            list_ttl: Duration::from_secs(2 * 60),
        }
    }
}

/// Adaptive rate limiter configuration
#[derive(Clone, Copy, Debug)]
pub struct LimiterConfig {
    pub enabled: bool,
    /// Initial capacity in tokens (and tokens/second refill)
    pub initial_rate: u64,
    /// Floor the limiter never adapts below
    pub min_rate: u64,
    /// Ceiling the limiter never adapts above
    pub max_rate: u64,
    /// Maintain an independent limiter per bucket
    pub per_bucket: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_rate: 1000,
            min_rate: 100,
            max_rate: 10_000,
            per_bucket: false,
        }
    }
}
