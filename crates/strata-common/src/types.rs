//! Core type definitions for Strata
//!
//! Wire-level metadata structures shared between the gateway, the cluster
//! coordinators, and the storage nodes, plus the durability parameter sets.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metadata for one object as reported by a node's listing endpoint.
///
/// Field names are part of the internal JSON protocol between the gateway
/// and the nodes; do not rename.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "ContentType")]
    pub content_type: String,
}

/// Sidecar metadata stored next to each payload file (`<key>.meta.json`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub etag: String,
    pub size: u64,
}

/// Result of a Head operation against a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadResult {
    pub content_type: String,
    pub etag: String,
    pub size: u64,
}

/// Manifest sidecar describing an erasure-coded object
/// (`<key>.manifest` on the first node)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcManifest {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub size: u64,
    pub content_type: String,
    pub checksum: String,
}

/// Replication parameters: N replicas, W write quorum, R read quorum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicationParams {
    pub replicas: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
}

impl ReplicationParams {
    /// Create a parameter set, enforcing `W + R > N` for read-your-writes
    pub fn new(replicas: usize, write_quorum: usize, read_quorum: usize) -> Result<Self> {
        if replicas == 0 || write_quorum == 0 || read_quorum == 0 {
            return Err(Error::Configuration(
                "replicas, write quorum, and read quorum must all be > 0".into(),
            ));
        }
        if write_quorum > replicas || read_quorum > replicas {
            return Err(Error::Configuration(format!(
                "quorums (w={write_quorum}, r={read_quorum}) cannot exceed replicas ({replicas})"
            )));
        }
        if write_quorum + read_quorum <= replicas {
            return Err(Error::Configuration(format!(
                "write + read quorum must be > replicas for consistency ({write_quorum}+{read_quorum} <= {replicas})"
            )));
        }
        Ok(Self {
            replicas,
            write_quorum,
            read_quorum,
        })
    }
}

impl Default for ReplicationParams {
    // 3/2/2 is the smallest overlapping configuration; reads are
    // first-success regardless, so R participates only in the W+R>N check
    fn default() -> Self {
        Self {
            replicas: 3,
            write_quorum: 2,
            read_quorum: 2,
        }
    }
}

/// Erasure-coding parameters: k data shards plus m parity shards
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcParams {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl EcParams {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(Error::Configuration(
                "data and parity shard counts must be > 0".into(),
            ));
        }
        if data_shards + parity_shards > 255 {
            return Err(Error::Configuration(
                "total shards must be <= 255".into(),
            ));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards (k + m)
    #[must_use]
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

impl Default for EcParams {
    fn default() -> Self {
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }
}

/// Durability policy for the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoragePolicy {
    #[default]
    Replication,
    ErasureCoding,
}

impl FromStr for StoragePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replication" => Ok(Self::Replication),
            "ec" => Ok(Self::ErasureCoding),
            other => Err(Error::Configuration(format!(
                "unknown storage policy {other:?} (expected 'replication' or 'ec')"
            ))),
        }
    }
}

impl fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replication => write!(f, "replication"),
            Self::ErasureCoding => write!(f, "ec"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_params_quorum() {
        assert!(ReplicationParams::new(3, 2, 2).is_ok());
        assert!(ReplicationParams::new(3, 2, 1).is_err()); // w + r == n
        assert!(ReplicationParams::new(3, 4, 1).is_err()); // w > n
        assert!(ReplicationParams::new(0, 1, 1).is_err());
    }

    #[test]
    fn test_ec_params() {
        let ec = EcParams::new(4, 2).unwrap();
        assert_eq!(ec.total_shards(), 6);
        assert!(EcParams::new(0, 2).is_err());
        assert!(EcParams::new(200, 100).is_err());
    }

    #[test]
    fn test_storage_policy_parse() {
        assert_eq!(
            "replication".parse::<StoragePolicy>().unwrap(),
            StoragePolicy::Replication
        );
        assert_eq!(
            "ec".parse::<StoragePolicy>().unwrap(),
            StoragePolicy::ErasureCoding
        );
        assert!("raid5".parse::<StoragePolicy>().is_err());
    }

    #[test]
    fn test_object_info_json_field_names() {
        let info = ObjectInfo {
            key: "a/b".into(),
            size: 5,
            last_modified: "2024-01-01T00:00:00.000Z".into(),
            etag: "\"abc\"".into(),
            content_type: "text/plain".into(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"Key\":\"a/b\""));
        assert!(json.contains("\"LastModified\""));
        assert!(json.contains("\"ETag\""));
    }
}
