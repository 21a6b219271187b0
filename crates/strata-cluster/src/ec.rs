//! Erasure-coding coordinator
//!
//! Objects are split into k data + m parity shards; shard *i* lives on the
//! i-th configured node as `<key>.shard.<i>` and a JSON manifest describing
//! the geometry lives on node 0 as `<key>.manifest`. Any k surviving shards
//! reconstruct the payload.

use crate::backend::{Backend, GetObject};
use crate::http::HttpNode;
use crate::repair::RepairStats;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use md5::{Digest, Md5};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::bufpool::{BufferPool, LARGE_BUFFER_SIZE};
use strata_common::range::parse_range;
use strata_common::{etag, EcManifest, EcParams, Error, HeadResult, ObjectInfo, Result};
use strata_erasure::ErasureCodec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const MANIFEST_SUFFIX: &str = ".manifest";

/// Erasure-coded cluster backend
pub struct EcCluster {
    nodes: Vec<Arc<HttpNode>>,
    params: EcParams,
    codec: ErasureCodec,
    scratch_dir: PathBuf,
    pool: Arc<BufferPool>,
    repair_stats: RepairStats,
    scratch_seq: AtomicU64,
}

impl EcCluster {
    /// Build the coordinator; requires at least k+m nodes
    pub fn new(
        node_urls: Vec<String>,
        params: EcParams,
        auth_token: Option<String>,
        scratch_dir: PathBuf,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        if node_urls.len() < params.total_shards() {
            return Err(Error::Configuration(format!(
                "not enough nodes for ec: need {}, have {}",
                params.total_shards(),
                node_urls.len()
            )));
        }

        let mut nodes = Vec::with_capacity(node_urls.len());
        for url in node_urls {
            nodes.push(Arc::new(HttpNode::new(url, auth_token.clone())?));
        }

        let codec = ErasureCodec::new(params).map_err(Error::from)?;

        Ok(Self {
            nodes,
            params,
            codec,
            scratch_dir,
            pool,
            repair_stats: RepairStats::default(),
            scratch_seq: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn repair_stats(&self) -> &RepairStats {
        &self.repair_stats
    }

    fn shard_key(key: &str, index: usize) -> String {
        format!("{key}.shard.{index}")
    }

    fn manifest_key(key: &str) -> String {
        format!("{key}{MANIFEST_SUFFIX}")
    }

    async fn fetch_manifest(&self, bucket: &str, key: &str) -> Result<EcManifest> {
        let obj = self.nodes[0]
            .get(bucket, &Self::manifest_key(key), None)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::no_such_key(bucket, key)
                } else {
                    e
                }
            })?;
        serde_json::from_slice(&obj.data)
            .map_err(|e| Error::Serialization(format!("manifest for {bucket}/{key}: {e}")))
    }

    /// Fetch every shard, missing ones as `None`
    async fn fetch_shards(&self, bucket: &str, key: &str) -> Vec<Option<Vec<u8>>> {
        let total = self.params.total_shards();
        let fetches = (0..total).map(|i| {
            let node = Arc::clone(&self.nodes[i]);
            let bucket = bucket.to_string();
            let shard_key = Self::shard_key(key, i);
            async move {
                match node.get(&bucket, &shard_key, None).await {
                    Ok(obj) => Some(obj.data.to_vec()),
                    Err(e) => {
                        if !e.is_not_found() {
                            warn!(shard = shard_key, error = %e, "shard fetch failed");
                        }
                        None
                    }
                }
            }
        });
        join_all(fetches).await
    }

    /// Stage the payload through the scratch directory
    ///
    /// Mirrors the write path's durability posture: the payload is parked
    /// on disk before encoding so the encode works from a stable copy.
    async fn stage_payload(&self, data: &Bytes) -> Result<Vec<u8>> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(format!(
            "ec-put-{}-{}",
            std::process::id(),
            self.scratch_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        let mut file = tokio::fs::File::open(&path).await?;
        let mut staged = Vec::with_capacity(data.len());
        let mut buf = self.pool.get(LARGE_BUFFER_SIZE);
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            staged.extend_from_slice(&buf[..n]);
        }
        self.pool.put(buf);
        drop(file);

        let _ = tokio::fs::remove_file(&path).await;
        Ok(staged)
    }

    /// Reconstruct a degraded object's shard set and re-upload the missing
    /// shards to their home nodes
    pub async fn repair_object(&self, bucket: &str, key: &str) -> Result<usize> {
        let shards = self.fetch_shards(bucket, key).await;
        let missing: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_none().then_some(i))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let rebuilt = self.codec.reconstruct(&shards).map_err(Error::from)?;
        let mut fixed = 0;
        for i in missing {
            let shard_key = Self::shard_key(key, i);
            match self.nodes[i]
                .put(
                    bucket,
                    &shard_key,
                    Bytes::from(rebuilt[i].clone()),
                    "application/octet-stream",
                    None,
                )
                .await
            {
                Ok(_) => {
                    fixed += 1;
                    debug!(bucket, key, shard = i, "restored shard");
                }
                Err(e) => {
                    warn!(bucket, key, shard = i, error = %e, "shard repair failed");
                }
            }
        }
        Ok(fixed)
    }

    /// One anti-entropy cycle over the manifests on node 0
    pub async fn repair_pass(&self, batch: usize) {
        self.repair_stats.record_scan();

        let listed = match self.nodes[0].list("", "", "", batch).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "ec repair listing failed");
                self.repair_stats.record_failed();
                return;
            }
        };

        for info in &listed {
            let Some(full_key) = info.key.strip_suffix(MANIFEST_SUFFIX) else {
                continue;
            };
            let Some((bucket, key)) = full_key.split_once('/') else {
                continue;
            };
            match self.repair_object(bucket, key).await {
                Ok(_) => self.repair_stats.record_fixed(),
                Err(e) => {
                    debug!(bucket, key, error = %e, "ec repair failed");
                    self.repair_stats.record_failed();
                }
            }
        }
    }
}

#[async_trait]
impl Backend for EcCluster {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String> {
        let staged = self.stage_payload(&data).await?;
        let size = staged.len() as u64;

        let digest: [u8; 16] = Md5::digest(&staged).into();
        let checksum = hex::encode(digest);
        if let Some(supplied) = content_md5 {
            if supplied != checksum && !base64_matches(supplied, &digest) {
                return Err(Error::BadDigest {
                    expected: supplied.to_string(),
                    actual: checksum,
                });
            }
        }

        let shards = self.codec.encode(&staged).map_err(Error::from)?;
        drop(staged);

        let manifest = EcManifest {
            data_shards: self.params.data_shards,
            parity_shards: self.params.parity_shards,
            size,
            content_type: content_type.to_string(),
            checksum: checksum.clone(),
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest)?);

        // All k+m shard writes plus the manifest must land; degraded
        // writes are not accepted.
        let mut uploads = Vec::with_capacity(shards.len() + 1);
        {
            let node = Arc::clone(&self.nodes[0]);
            let bucket = bucket.to_string();
            let manifest_key = Self::manifest_key(key);
            uploads.push(tokio::spawn(async move {
                node.put(&bucket, &manifest_key, manifest_bytes, "application/json", None)
                    .await
            }));
        }
        for (i, shard) in shards.into_iter().enumerate() {
            let node = Arc::clone(&self.nodes[i]);
            let bucket = bucket.to_string();
            let shard_key = Self::shard_key(key, i);
            uploads.push(tokio::spawn(async move {
                node.put(
                    &bucket,
                    &shard_key,
                    Bytes::from(shard),
                    "application/octet-stream",
                    None,
                )
                .await
            }));
        }

        for upload in join_all(uploads).await {
            upload.map_err(|e| Error::internal(format!("shard upload task: {e}")))??;
        }

        Ok(etag::quote(&checksum))
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> Result<GetObject> {
        let manifest = self.fetch_manifest(bucket, key).await?;
        let shards = self.fetch_shards(bucket, key).await;

        let payload = self
            .codec
            .decode(&shards, manifest.size as usize)
            .map_err(Error::from)?;
        let data = Bytes::from(payload);
        let object_etag = etag::quote(&manifest.checksum);

        match range {
            // Ranges on erasure-coded objects reconstruct the whole
            // payload, then slice.
            Some(spec) => {
                let range = parse_range(spec, manifest.size)?;
                let sliced = data.slice(range.start as usize..=range.end as usize);
                Ok(GetObject {
                    data: sliced,
                    content_type: manifest.content_type,
                    etag: object_etag,
                    status: 206,
                    content_range: Some(range.content_range()),
                })
            }
            None => Ok(GetObject {
                data,
                content_type: manifest.content_type,
                etag: object_etag,
                status: 200,
                content_range: None,
            }),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>> {
        match self.fetch_manifest(bucket, key).await {
            Ok(manifest) => Ok(Some(HeadResult {
                content_type: manifest.content_type,
                etag: etag::quote(&manifest.checksum),
                size: manifest.size,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut deletes = Vec::with_capacity(self.params.total_shards() + 1);
        {
            let node = Arc::clone(&self.nodes[0]);
            let bucket = bucket.to_string();
            let manifest_key = Self::manifest_key(key);
            deletes.push(async move { node.delete(&bucket, &manifest_key).await }.boxed());
        }
        for i in 0..self.params.total_shards() {
            let node = Arc::clone(&self.nodes[i]);
            let bucket = bucket.to_string();
            let shard_key = Self::shard_key(key, i);
            deletes.push(async move { node.delete(&bucket, &shard_key).await }.boxed());
        }

        // Individual failures are tolerated; repair reconciles.
        for result in join_all(deletes).await {
            if let Err(e) = result {
                warn!(bucket, key, error = %e, "ec delete failed");
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>> {
        // Listings see manifests and shards; surface one entry per
        // manifest with the geometry-true size from its contents.
        let fetch_limit = (limit * (self.params.total_shards() + 1)).min(10_000);
        let listed = self.nodes[0]
            .list(bucket, prefix, marker, fetch_limit)
            .await?;

        let manifests: Vec<ObjectInfo> = listed
            .into_iter()
            .filter(|info| info.key.ends_with(MANIFEST_SUFFIX))
            .collect();

        let bucket = bucket.to_string();
        let results: Vec<Option<ObjectInfo>> = stream::iter(manifests)
            .map(|info| {
                let bucket = bucket.clone();
                async move {
                    let key = info.key.strip_suffix(MANIFEST_SUFFIX)?.to_string();
                    let manifest = self.fetch_manifest(&bucket, &key).await.ok()?;
                    Some(ObjectInfo {
                        key,
                        size: manifest.size,
                        last_modified: info.last_modified,
                        etag: etag::quote(&manifest.checksum),
                        content_type: manifest.content_type,
                    })
                }
            })
            .buffered(16)
            .collect()
            .await;

        let mut objects: Vec<ObjectInfo> = results.into_iter().flatten().collect();
        objects.truncate(limit);
        Ok(objects)
    }
}

/// Accept the RFC Content-MD5 base64 form alongside raw hex
fn base64_matches(supplied: &str, digest: &[u8; 16]) -> bool {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(supplied)
        .is_ok_and(|raw| raw == digest)
}
