//! The storage backend capability trait

use async_trait::async_trait;
use bytes::Bytes;
use strata_common::{HeadResult, ObjectInfo, Result};

/// A fetched object
///
/// The payload is held as [`Bytes`] so one fetch can feed every coalesced
/// waiter and, when small enough, the data cache.
#[derive(Clone, Debug)]
pub struct GetObject {
    pub data: Bytes,
    pub content_type: String,
    pub etag: String,
    /// 200 for whole-object reads, 206 for ranges
    pub status: u16,
    /// `Content-Range` value when status is 206
    pub content_range: Option<String>,
}

/// Object operations shared by a single node, a replicated cluster, and an
/// erasure-coded cluster
///
/// Implementation types stay private to their modules; callers hold an
/// `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store an object; returns the quoted ETag
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String>;

    /// Fetch an object, optionally bounded to an HTTP range
    async fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> Result<GetObject>;

    /// Fetch object metadata; `None` when the object does not exist
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>>;

    /// Remove an object (idempotent)
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// List objects by prefix, strictly after `marker`, up to `limit`
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>>;
}
