//! Quorum replication coordinator
//!
//! Writes fan out to the N ring replicas and acknowledge at W successes;
//! the remaining writes continue on detached tasks and an asynchronous
//! repair pass closes residual gaps. Reads race the replicas and return
//! the first hit, cancelling the siblings.

use crate::backend::{Backend, GetObject};
use crate::http::HttpNode;
use crate::repair::RepairStats;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_common::{Error, HeadResult, ObjectInfo, ReplicationParams, Result};
use strata_placement::HashRing;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Replicated cluster backend over the placement ring
pub struct Replicated {
    ring: Arc<HashRing>,
    nodes: HashMap<String, Arc<HttpNode>>,
    params: ReplicationParams,
    repair_stats: RepairStats,
    /// Which node's listing seeds the next repair cycle
    repair_cursor: AtomicUsize,
}

impl Replicated {
    /// Build the coordinator; `params` must already satisfy `W + R > N`
    pub fn new(
        node_urls: Vec<String>,
        params: ReplicationParams,
        auth_token: Option<String>,
    ) -> Result<Self> {
        if node_urls.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        let mut nodes = HashMap::with_capacity(node_urls.len());
        for url in &node_urls {
            nodes.insert(
                url.clone(),
                Arc::new(HttpNode::new(url.clone(), auth_token.clone())?),
            );
        }

        Ok(Self {
            ring: Arc::new(HashRing::new(node_urls)),
            nodes,
            params,
            repair_stats: RepairStats::default(),
            repair_cursor: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    #[must_use]
    pub fn repair_stats(&self) -> &RepairStats {
        &self.repair_stats
    }

    /// The replica set for an object, in canonical order
    fn replicas(&self, bucket: &str, key: &str) -> Vec<Arc<HttpNode>> {
        self.ring
            .get_nodes(&format!("{bucket}/{key}"), self.params.replicas)
            .into_iter()
            .map(|url| Arc::clone(&self.nodes[url]))
            .collect()
    }

    /// Re-replicate one object to any replica that is missing it
    ///
    /// Finds a replica that still has the object, then writes it back to
    /// replicas whose Head reports absence. Best-effort; the caller counts
    /// failures.
    pub async fn repair_object(&self, bucket: &str, key: &str) -> Result<usize> {
        let replicas = self.replicas(bucket, key);
        if replicas.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        let mut source: Option<(usize, GetObject)> = None;
        for (idx, node) in replicas.iter().enumerate() {
            if let Ok(obj) = node.get(bucket, key, None).await {
                if obj.status == 200 {
                    source = Some((idx, obj));
                    break;
                }
            }
        }
        let Some((source_idx, obj)) = source else {
            return Err(Error::node(format!(
                "no replica holds {bucket}/{key}; nothing to repair from"
            )));
        };

        let mut fixed = 0;
        for (idx, node) in replicas.iter().enumerate() {
            if idx == source_idx {
                continue;
            }
            match node.head(bucket, key).await {
                Ok(Some(_)) => {}
                _ => {
                    match node
                        .put(bucket, key, obj.data.clone(), &obj.content_type, None)
                        .await
                    {
                        Ok(_) => {
                            fixed += 1;
                            debug!(bucket, key, node = node.base_url(), "repaired replica");
                        }
                        Err(e) => {
                            warn!(bucket, key, node = node.base_url(), error = %e, "repair write failed");
                        }
                    }
                }
            }
        }

        Ok(fixed)
    }

    /// One anti-entropy cycle: list a batch from one node and reconcile
    /// every listed object across its replica set
    ///
    /// Cycles rotate the seed node so no node's objects stay in a blind
    /// spot.
    pub async fn repair_pass(&self, batch: usize) {
        self.repair_stats.record_scan();

        let all = self.ring.all_nodes();
        let cursor = self.repair_cursor.fetch_add(1, Ordering::Relaxed);
        let seed_url = &all[cursor % all.len()];
        let seed = &self.nodes[seed_url];

        let objects = match seed.list("", "", "", batch).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(node = seed.base_url(), error = %e, "repair listing failed");
                self.repair_stats.record_failed();
                return;
            }
        };

        for info in &objects {
            let Some((bucket, key)) = info.key.split_once('/') else {
                continue;
            };
            match self.repair_object(bucket, key).await {
                Ok(_) => self.repair_stats.record_fixed(),
                Err(e) => {
                    debug!(key = info.key, error = %e, "repair failed");
                    self.repair_stats.record_failed();
                }
            }
        }

        debug!(objects = objects.len(), seed = seed.base_url(), "repair cycle complete");
    }
}

#[async_trait]
impl Backend for Replicated {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String> {
        let replicas = self.replicas(bucket, key);
        if replicas.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        let (tx, mut rx) = mpsc::channel(replicas.len());
        for node in replicas {
            let tx = tx.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let data = data.clone();
            let content_type = content_type.to_string();
            let content_md5 = content_md5.map(ToString::to_string);
            // Detached: nodes that have not acked when the client is
            // answered keep writing in the background.
            tokio::spawn(async move {
                let result = node
                    .put(&bucket, &key, data, &content_type, content_md5.as_deref())
                    .await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut acked = 0;
        let mut first_etag: Option<String> = None;
        let mut digest_rejected: Option<Error> = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(etag) => {
                    acked += 1;
                    if first_etag.is_none() {
                        first_etag = Some(etag);
                    }
                    if acked >= self.params.write_quorum {
                        return Ok(first_etag.expect("etag recorded with first ack"));
                    }
                }
                Err(e @ Error::BadDigest { .. }) => {
                    // Identical bytes fail the digest check on every node
                    digest_rejected = Some(e);
                }
                Err(e) => {
                    warn!(bucket, key, error = %e, "replica write failed");
                }
            }
        }

        if let Some(e) = digest_rejected {
            return Err(e);
        }
        Err(Error::QuorumNotMet {
            acked,
            required: self.params.write_quorum,
        })
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> Result<GetObject> {
        let replicas = self.replicas(bucket, key);
        if replicas.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        // First success wins; dropping the set cancels the laggards.
        let mut in_flight: FuturesUnordered<_> = replicas
            .into_iter()
            .map(|node| {
                let bucket = bucket.to_string();
                let key = key.to_string();
                let range = range.map(ToString::to_string);
                async move { node.get(&bucket, &key, range.as_deref()).await }
            })
            .collect();

        let mut last_err: Option<Error> = None;
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(obj) => return Ok(obj),
                Err(e) if e.is_not_found() => {}
                Err(e) => last_err = Some(e),
            }
        }

        // NoSuchKey only when every replica reported 404; otherwise the
        // read failed for real.
        match last_err {
            Some(e) => Err(e),
            None => Err(Error::no_such_key(bucket, key)),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>> {
        for node in self.replicas(bucket, key) {
            if let Ok(Some(result)) = node.head(bucket, key).await {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let replicas = self.replicas(bucket, key);
        let deletes = replicas.into_iter().map(|node| {
            let bucket = bucket.to_string();
            let key = key.to_string();
            async move {
                if let Err(e) = node.delete(&bucket, &key).await {
                    warn!(bucket, key, node = node.base_url(), error = %e, "replica delete failed");
                }
            }
        });
        futures::future::join_all(deletes).await;
        // Deletes are idempotent on nodes; stragglers reconcile via repair.
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>> {
        let all = self.ring.all_nodes();
        if all.is_empty() {
            return Err(Error::NoNodesAvailable);
        }
        self.nodes[&all[0]].list(bucket, prefix, marker, limit).await
    }
}
