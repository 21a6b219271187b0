//! The gateway role
//!
//! Parses S3 requests, admits them through the adaptive limiter, serves
//! reads through the cache tier and single-flight coalescer, and routes
//! object operations to the configured durability backend (replication or
//! erasure coding). Background tasks run anti-entropy repair, the
//! multipart sweeper, the cache sweeper, and limiter adaptation.

use crate::cache::{CacheTier, CachedObject};
use crate::coalesce::Coalescer;
use crate::limiter::LimiterSet;
use crate::multipart::MultipartManager;
use crate::util::{parse_query, split_object_path};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_cluster::{Backend, EcCluster, GetObject, Replicated};
use strata_common::bufpool::BufferPool;
use strata_common::config::GatewayConfig;
use strata_common::range::parse_range;
use strata_common::{Error, HeadResult, ObjectInfo, Result, StoragePolicy};
use strata_s3::xml::{
    self, CommonPrefix, CompleteMultipartUploadResult, Contents, InitiateMultipartUploadResult,
    ListBucketResult,
};
use strata_s3::{s3_error_response, RequestIdGen, S3Metrics, S3Operation};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Longest a request waits on the limiter before SlowDown
const ADMIT_WAIT: Duration = Duration::from_secs(10);

/// Cadence of the cache sweeper
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of limiter adaptation
const ADAPT_INTERVAL: Duration = Duration::from_secs(10);

/// Default repair timeout per object write-back pass after a PUT
const POST_PUT_REPAIR_TIMEOUT: Duration = Duration::from_secs(10);

struct Gateway {
    cfg: GatewayConfig,
    backend: Arc<dyn Backend>,
    replicated: Option<Arc<Replicated>>,
    ec: Option<Arc<EcCluster>>,
    multipart: Arc<MultipartManager>,
    cache: Arc<CacheTier>,
    get_requests: Coalescer<GetObject>,
    head_requests: Coalescer<Option<HeadResult>>,
    list_requests: Coalescer<Arc<Vec<ObjectInfo>>>,
    limiter: LimiterSet,
    metrics: Arc<S3Metrics>,
    request_ids: RequestIdGen,
    pool: Arc<BufferPool>,
}

/// Run the gateway until ctrl-c
pub async fn run(cfg: GatewayConfig) -> anyhow::Result<()> {
    let (gateway, app) = build(cfg).await?;
    spawn_background_loops(&gateway);

    let listener = tokio::net::TcpListener::bind(&gateway.cfg.listen).await?;
    info!(
        addr = gateway.cfg.listen,
        nodes = gateway.cfg.nodes.len(),
        policy = %gateway.cfg.storage_policy,
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down gateway");
        })
        .await?;

    Ok(())
}

/// Assemble the gateway state and router
async fn build(cfg: GatewayConfig) -> anyhow::Result<(Arc<Gateway>, Router)> {
    if cfg.nodes.is_empty() {
        anyhow::bail!("gateway requires at least one node URL");
    }
    tokio::fs::create_dir_all(&cfg.scratch_dir).await?;

    let pool = Arc::new(BufferPool::new());

    let (backend, replicated, ec): (
        Arc<dyn Backend>,
        Option<Arc<Replicated>>,
        Option<Arc<EcCluster>>,
    ) = match cfg.storage_policy {
        StoragePolicy::Replication => {
            info!(
                replicas = cfg.replication.replicas,
                w = cfg.replication.write_quorum,
                r = cfg.replication.read_quorum,
                "using replication"
            );
            let cluster = Arc::new(Replicated::new(
                cfg.nodes.clone(),
                cfg.replication,
                cfg.backend_auth_token.clone(),
            )?);
            (
                Arc::clone(&cluster) as Arc<dyn Backend>,
                Some(cluster),
                None,
            )
        }
        StoragePolicy::ErasureCoding => {
            info!(
                data = cfg.ec.data_shards,
                parity = cfg.ec.parity_shards,
                "using erasure coding"
            );
            let cluster = Arc::new(EcCluster::new(
                cfg.nodes.clone(),
                cfg.ec,
                cfg.backend_auth_token.clone(),
                cfg.scratch_dir.clone(),
                Arc::clone(&pool),
            )?);
            (Arc::clone(&cluster) as Arc<dyn Backend>, None, Some(cluster))
        }
    };

    let multipart = Arc::new(MultipartManager::new(
        cfg.scratch_dir.clone(),
        Arc::clone(&backend),
        Arc::clone(&pool),
    ));

    let gateway = Arc::new(Gateway {
        backend,
        replicated,
        ec,
        multipart,
        cache: Arc::new(CacheTier::new(&cfg.cache)),
        get_requests: Coalescer::new(),
        head_requests: Coalescer::new(),
        list_requests: Coalescer::new(),
        limiter: LimiterSet::new(&cfg.limiter),
        metrics: Arc::new(S3Metrics::new()),
        request_ids: RequestIdGen::new(),
        pool,
        cfg,
    });

    let app = Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::max(gateway.cfg.max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&gateway));

    Ok((gateway, app))
}

fn spawn_background_loops(gateway: &Arc<Gateway>) {
    // Anti-entropy repair
    {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(gateway.cfg.repair.interval).await;
                info!(batch = gateway.cfg.repair.batch, "starting anti-entropy repair");
                if let Some(cluster) = &gateway.replicated {
                    cluster.repair_pass(gateway.cfg.repair.batch).await;
                } else if let Some(cluster) = &gateway.ec {
                    cluster.repair_pass(gateway.cfg.repair.batch).await;
                }
            }
        });
    }

    // Stale multipart uploads
    {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(gateway.cfg.multipart.sweep_interval).await;
                gateway.multipart.sweep_stale(gateway.cfg.multipart.ttl);
            }
        });
    }

    // Expired cache entries
    {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CACHE_SWEEP_INTERVAL).await;
                gateway.cache.sweep_expired();
            }
        });
    }

    // Limiter adaptation from the rolling request window
    {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ADAPT_INTERVAL).await;
                let window = gateway.metrics.window_stats();
                gateway
                    .limiter
                    .update_metrics(window.error_rate, Duration::from_micros(window.p99_us));
            }
        });
    }
}

async fn handle(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let started = Instant::now();
    let _inflight = gateway.metrics.inflight_guard();
    let path = req.uri().path().to_string();

    // Health and debug paths short-circuit ahead of auth
    match path.as_str() {
        "/health" => return text_response(StatusCode::OK, "OK".into()),
        "/ready" => return text_response(StatusCode::OK, "READY".into()),
        _ => {}
    }
    if path.starts_with("/debug/vars") {
        return text_response(StatusCode::OK, gateway.debug_vars());
    }

    let request_id = gateway.request_ids.next();

    if !gateway.authorized(&req) {
        gateway.metrics.record_error(S3Operation::Other, "AccessDenied");
        let response = s3_error_response(&Error::AccessDenied, &path, &request_id);
        gateway
            .metrics
            .record_request(S3Operation::Other, 403, elapsed_us(started));
        return response;
    }

    let query = parse_query(req.uri().query().unwrap_or(""));
    let (bucket, key) = split_object_path(&path);
    if bucket.is_empty() {
        let err = Error::InvalidUri("missing bucket".into());
        gateway.metrics.record_error(S3Operation::Other, err.s3_error_code());
        let response = s3_error_response(&err, &path, &request_id);
        gateway
            .metrics
            .record_request(S3Operation::Other, 400, elapsed_us(started));
        return response;
    }

    let (op, result) = gateway.dispatch(req, &bucket, &key, &query).await;
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            gateway.metrics.record_error(op, e.s3_error_code());
            if e.http_status_code() >= 500 {
                error!(op = op.as_str(), bucket, key, error = %e, "request failed");
            }
            s3_error_response(&e, &path, &request_id)
        }
    };

    gateway
        .metrics
        .record_request(op, response.status().as_u16(), elapsed_us(started));
    response
}

impl Gateway {
    fn authorized(&self, req: &Request) -> bool {
        let Some(token) = &self.cfg.auth_token else {
            return true;
        };
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {token}"))
    }

    /// Operation selection: `uploads` beats `uploadId` beats `list-type=2`
    /// beats plain method dispatch
    async fn dispatch(
        &self,
        req: Request,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> (S3Operation, Result<Response>) {
        let method = req.method().clone();

        if query.contains_key("uploads") {
            return if method == Method::POST {
                (
                    S3Operation::InitiateMultipartUpload,
                    self.initiate_multipart(bucket, key).await,
                )
            } else {
                (
                    S3Operation::Other,
                    Err(Error::MethodNotAllowed(method.to_string())),
                )
            };
        }

        if let Some(upload_id) = query.get("uploadId") {
            if method == Method::PUT && query.contains_key("partNumber") {
                let part_number = query
                    .get("partNumber")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                return (
                    S3Operation::UploadPart,
                    self.upload_part(upload_id, part_number, req).await,
                );
            }
            if method == Method::POST {
                return (
                    S3Operation::CompleteMultipartUpload,
                    self.complete_multipart(bucket, key, upload_id, req).await,
                );
            }
            if method == Method::DELETE {
                return (
                    S3Operation::AbortMultipartUpload,
                    self.abort_multipart(upload_id).await,
                );
            }
        }

        if method == Method::GET && query.get("list-type").map(String::as_str) == Some("2") {
            return (S3Operation::ListObjects, self.list_objects(bucket, query).await);
        }

        match method.as_str() {
            "PUT" => (S3Operation::PutObject, self.put_object(bucket, key, req).await),
            "GET" => (S3Operation::GetObject, self.get_object(bucket, key, req).await),
            "HEAD" => (S3Operation::HeadObject, self.head_object(bucket, key).await),
            "DELETE" => (
                S3Operation::DeleteObject,
                self.delete_object(bucket, key).await,
            ),
            other => (
                S3Operation::Other,
                Err(Error::MethodNotAllowed(other.to_string())),
            ),
        }
    }

    async fn admit(&self, bucket: &str) -> Result<()> {
        if self.limiter.admit(bucket, ADMIT_WAIT).await {
            Ok(())
        } else {
            Err(Error::SlowDown)
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, req: Request) -> Result<Response> {
        self.admit(bucket).await?;

        let content_type = header_or(&req, header::CONTENT_TYPE, "application/octet-stream");
        let content_md5 = header_opt(&req, "Content-MD5");
        let body = read_body(req, self.cfg.max_body).await?;

        let object_etag = self
            .backend
            .put(bucket, key, body, &content_type, content_md5.as_deref())
            .await?;

        // Invalidate after durability, before the response
        self.cache.invalidate_object(bucket, key);

        // Close residual replica gaps off the request path
        if let Some(cluster) = &self.replicated {
            let cluster = Arc::clone(cluster);
            let bucket = bucket.to_string();
            let key = key.to_string();
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    POST_PUT_REPAIR_TIMEOUT,
                    cluster.repair_object(&bucket, &key),
                )
                .await;
            });
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, object_etag)
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()))
    }

    async fn get_object(&self, bucket: &str, key: &str, req: Request) -> Result<Response> {
        self.admit(bucket).await?;
        let range = header_opt(&req, "Range");

        // A cached full object serves both whole and ranged reads
        if let Some(cached) = self.cache.get_data(bucket, key) {
            return serve_cached(cached, range.as_deref());
        }

        let fingerprint = format!("get:{bucket}/{key}:{}", range.as_deref().unwrap_or(""));
        let backend = Arc::clone(&self.backend);
        let fetch_bucket = bucket.to_string();
        let fetch_key = key.to_string();
        let fetch_range = range.clone();
        let object = self
            .get_requests
            .run(&fingerprint, || async move {
                backend
                    .get(&fetch_bucket, &fetch_key, fetch_range.as_deref())
                    .await
            })
            .await?;

        if object.status == 200 {
            self.cache.set_data(
                bucket,
                key,
                &CachedObject {
                    data: object.data.clone(),
                    content_type: object.content_type.clone(),
                    etag: object.etag.clone(),
                },
            );
            self.cache.set_metadata(
                bucket,
                key,
                Some(HeadResult {
                    content_type: object.content_type.clone(),
                    etag: object.etag.clone(),
                    size: object.data.len() as u64,
                }),
            );
        }

        object_response(&object)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Response> {
        self.admit(bucket).await?;

        if let Some(cached) = self.cache.get_head(bucket, key) {
            return head_response(bucket, key, cached);
        }
        // A prior GET may have filled the metadata cache
        if let Some(cached) = self.cache.get_metadata(bucket, key) {
            return head_response(bucket, key, cached);
        }

        let fingerprint = format!("head:{bucket}/{key}");
        let backend = Arc::clone(&self.backend);
        let fetch_bucket = bucket.to_string();
        let fetch_key = key.to_string();
        let result = self
            .head_requests
            .run(&fingerprint, || async move {
                backend.head(&fetch_bucket, &fetch_key).await
            })
            .await?;

        self.cache.set_head(bucket, key, result.clone());
        self.cache.set_metadata(bucket, key, result.clone());

        head_response(bucket, key, result)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<Response> {
        self.admit(bucket).await?;

        self.backend.delete(bucket, key).await?;
        self.cache.invalidate_object(bucket, key);

        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        query: &HashMap<String, String>,
    ) -> Result<Response> {
        self.admit(bucket).await?;

        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let delimiter = query.get("delimiter").cloned().unwrap_or_default();
        let continuation_token = query.get("continuation-token").cloned().unwrap_or_default();
        let start_after = query.get("start-after").cloned().unwrap_or_default();
        let max_keys = query
            .get("max-keys")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1000);

        let marker = if continuation_token.is_empty() {
            start_after.clone()
        } else {
            continuation_token.clone()
        };

        let fingerprint = self.cache.list_fingerprint(bucket, &prefix, &marker, max_keys);
        let objects = match self.cache.get_list(&fingerprint) {
            Some(objects) => objects,
            None => {
                let backend = Arc::clone(&self.backend);
                let fetch_bucket = bucket.to_string();
                let fetch_prefix = prefix.clone();
                let fetch_marker = marker.clone();
                let objects = self
                    .list_requests
                    .run(&format!("list:{fingerprint}"), || async move {
                        backend
                            .list(&fetch_bucket, &fetch_prefix, &fetch_marker, max_keys + 1)
                            .await
                            .map(Arc::new)
                    })
                    .await?;
                self.cache.set_list(&fingerprint, Arc::clone(&objects));
                objects
            }
        };

        let is_truncated = objects.len() > max_keys;
        let page = &objects[..objects.len().min(max_keys)];

        let mut contents = Vec::new();
        let mut common_prefixes = Vec::new();
        let mut seen_prefixes = std::collections::HashSet::new();
        for object in page {
            if !delimiter.is_empty() {
                let remainder = object.key.strip_prefix(prefix.as_str()).unwrap_or(&object.key);
                if let Some(idx) = remainder.find(delimiter.as_str()) {
                    let common = format!("{prefix}{}", &remainder[..idx + delimiter.len()]);
                    if seen_prefixes.insert(common.clone()) {
                        common_prefixes.push(CommonPrefix { prefix: common });
                    }
                    continue;
                }
            }
            contents.push(Contents {
                key: object.key.clone(),
                last_modified: object.last_modified.clone(),
                etag: object.etag.clone(),
                size: object.size,
                storage_class: "STANDARD".to_string(),
            });
        }

        let next_continuation_token = if is_truncated {
            page.last().map(|o| o.key.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        let key_count = contents.len() + common_prefixes.len();
        let doc = ListBucketResult {
            name: bucket.to_string(),
            prefix,
            delimiter,
            max_keys,
            is_truncated,
            key_count,
            contents,
            common_prefixes,
            continuation_token,
            next_continuation_token,
            start_after,
        };

        xml_response(StatusCode::OK, &xml::to_xml(&doc)?)
    }

    async fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<Response> {
        self.admit(bucket).await?;

        let upload_id = self.multipart.initiate(bucket, key).await?;
        let doc = InitiateMultipartUploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        };
        xml_response(StatusCode::OK, &xml::to_xml(&doc)?)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        req: Request,
    ) -> Result<Response> {
        if part_number == 0 {
            return Err(Error::InvalidPart { part_number: 0 });
        }
        let body = read_body(req, self.cfg.max_body).await?;
        let part_etag = self.multipart.upload_part(upload_id, part_number, body).await?;

        Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, part_etag)
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        req: Request,
    ) -> Result<Response> {
        let body = read_body(req, self.cfg.max_body).await?;
        let doc = xml::parse_complete_multipart(&body)?;

        let object_etag = self.multipart.complete(upload_id, &doc.parts).await?;
        self.cache.invalidate_object(bucket, key);

        let result = CompleteMultipartUploadResult {
            location: format!("/{bucket}/{key}"),
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: object_etag,
        };
        xml_response(StatusCode::OK, &xml::to_xml(&result)?)
    }

    async fn abort_multipart(&self, upload_id: &str) -> Result<Response> {
        self.multipart.abort(upload_id).await?;
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()))
    }

    /// Counters for `/debug/vars`
    fn debug_vars(&self) -> String {
        let mut out = self.metrics.export_text();
        out.push_str(&self.cache.export_text());

        let coalesce = self.get_requests.stats();
        let _ = writeln!(out, "coalesce_get_total {}", coalesce.total_requests);
        let _ = writeln!(out, "coalesce_get_saved {}", coalesce.saved_requests);
        let head = self.head_requests.stats();
        let _ = writeln!(out, "coalesce_head_total {}", head.total_requests);
        let _ = writeln!(out, "coalesce_head_saved {}", head.saved_requests);
        let list = self.list_requests.stats();
        let _ = writeln!(out, "coalesce_list_total {}", list.total_requests);
        let _ = writeln!(out, "coalesce_list_saved {}", list.saved_requests);

        let limiter = self.limiter.stats();
        let _ = writeln!(out, "limiter_max_tokens {}", limiter.max_tokens);
        let _ = writeln!(out, "limiter_allowed {}", limiter.allowed);
        let _ = writeln!(out, "limiter_rejected {}", limiter.rejected);
        let _ = writeln!(out, "limiter_adaptations {}", limiter.adaptations);

        if let Some(cluster) = &self.replicated {
            let stats = cluster.repair_stats();
            let _ = writeln!(out, "repair_scans_total {}", stats.scans());
            let _ = writeln!(out, "repair_fixed_total {}", stats.fixed());
            let _ = writeln!(out, "repair_failed_total {}", stats.failed());
        }
        if let Some(cluster) = &self.ec {
            let stats = cluster.repair_stats();
            let _ = writeln!(out, "repair_scans_total {}", stats.scans());
            let _ = writeln!(out, "repair_fixed_total {}", stats.fixed());
            let _ = writeln!(out, "repair_failed_total {}", stats.failed());
        }

        let _ = writeln!(out, "multipart_active_uploads {}", self.multipart.active_uploads());
        let pool = self.pool.stats();
        let _ = writeln!(out, "bufpool_gets {}", pool.gets);
        let _ = writeln!(out, "bufpool_puts {}", pool.puts);

        out
    }
}

/// Serve a request from a cached full object, applying any range locally
fn serve_cached(cached: CachedObject, range: Option<&str>) -> Result<Response> {
    match range {
        None => build_object_response(
            cached.data,
            &cached.content_type,
            &cached.etag,
            StatusCode::OK,
            None,
        ),
        Some(spec) => {
            let range = parse_range(spec, cached.data.len() as u64)?;
            let sliced = cached
                .data
                .slice(range.start as usize..=range.end as usize);
            build_object_response(
                sliced,
                &cached.content_type,
                &cached.etag,
                StatusCode::PARTIAL_CONTENT,
                Some(range.content_range()),
            )
        }
    }
}

fn object_response(object: &GetObject) -> Result<Response> {
    build_object_response(
        object.data.clone(),
        &object.content_type,
        &object.etag,
        StatusCode::from_u16(object.status).unwrap_or(StatusCode::OK),
        object.content_range.clone(),
    )
}

fn build_object_response(
    data: Bytes,
    content_type: &str,
    object_etag: &str,
    status: StatusCode,
    content_range: Option<String>,
) -> Result<Response> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, object_etag)
        .header(header::CONTENT_LENGTH, data.len())
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(Body::from(data))
        .map_err(|e| Error::internal(e.to_string()))
}

fn head_response(bucket: &str, key: &str, result: Option<HeadResult>) -> Result<Response> {
    let Some(head) = result else {
        return Err(Error::no_such_key(bucket, key));
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, head.content_type)
        .header(header::ETAG, head.etag)
        .header(header::CONTENT_LENGTH, head.size)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::empty())
        .map_err(|e| Error::internal(e.to_string()))
}

fn xml_response(status: StatusCode, body: &str) -> Result<Response> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body.to_string()))
        .map_err(|e| Error::internal(e.to_string()))
}

fn text_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response")
}

fn header_or(req: &Request, name: header::HeaderName, default: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn header_opt(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

async fn read_body(req: Request, limit: usize) -> Result<Bytes> {
    axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| Error::internal(format!("read body: {e}")))
}

fn elapsed_us(started: Instant) -> u64 {
    started.elapsed().as_micros() as u64
}

#[cfg(test)]
mod e2e_tests {
    //! End-to-end: real nodes and a real gateway on loopback sockets,
    //! driven over HTTP.

    use super::*;
    use crate::node;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_common::config::{CacheConfig, LimiterConfig, MultipartConfig, RepairConfig};
    use strata_common::{EcParams, ReplicationParams};
    use strata_store::LocalStore;
    use tempfile::TempDir;

    struct TestCluster {
        gateway_url: String,
        /// GET requests observed per node, for coalescing assertions
        node_gets: Arc<AtomicUsize>,
        _dirs: Vec<TempDir>,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn start_cluster(node_count: usize, policy: StoragePolicy) -> TestCluster {
        start_cluster_with(node_count, policy, None).await
    }

    async fn start_cluster_with(
        node_count: usize,
        policy: StoragePolicy,
        auth_token: Option<String>,
    ) -> TestCluster {
        let node_gets = Arc::new(AtomicUsize::new(0));
        let mut dirs = Vec::new();
        let mut node_urls = Vec::new();

        for _ in 0..node_count {
            let dir = TempDir::new().unwrap();
            let store = LocalStore::open(dir.path()).unwrap();
            let counter = Arc::clone(&node_gets);
            let app = node::router(store, None, 64 * 1024 * 1024).layer(
                axum::middleware::from_fn(move |req: Request, next: axum::middleware::Next| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if req.method() == Method::GET && req.uri().query().is_none() {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        next.run(req).await
                    }
                }),
            );
            node_urls.push(serve(app).await);
            dirs.push(dir);
        }

        let scratch = TempDir::new().unwrap();
        let cfg = GatewayConfig {
            listen: String::new(),
            nodes: node_urls,
            storage_policy: policy,
            replication: ReplicationParams::new(3.min(node_count), 2.min(node_count), 2.min(node_count))
                .unwrap(),
            ec: EcParams::new(4, 2).unwrap(),
            backend_auth_token: None,
            auth_token,
            scratch_dir: scratch.path().to_path_buf(),
            max_body: 64 * 1024 * 1024,
            repair: RepairConfig::default(),
            multipart: MultipartConfig::default(),
            cache: CacheConfig::default(),
            limiter: LimiterConfig::default(),
        };
        let (_gateway, app) = build(cfg).await.unwrap();
        let gateway_url = serve(app).await;
        dirs.push(scratch);

        TestCluster {
            gateway_url,
            node_gets,
            _dirs: dirs,
        }
    }

    fn extract_tag(xml: &str, tag: &str) -> Option<String> {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = xml.find(&open)? + open.len();
        let end = xml[start..].find(&close)? + start;
        Some(xml[start..end].to_string())
    }

    #[tokio::test]
    async fn test_put_get_head_delete_roundtrip() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/k", cluster.gateway_url);

        let resp = client
            .put(&url)
            .header("Content-Type", "text/plain")
            .body("hello")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("ETag").unwrap(),
            "\"5d41402abc4b2a76b9719d911017c592\""
        );

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("Content-Length").unwrap(), "5");
        assert_eq!(resp.headers().get("Accept-Ranges").unwrap(), "bytes");
        assert_eq!(resp.headers().get("Content-Type").unwrap(), "text/plain");
        assert_eq!(resp.text().await.unwrap(), "hello");

        let resp = client.head(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("Content-Length").unwrap(), "5");

        let resp = client.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 204);
        let resp = client.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 204);

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Code>NoSuchKey</Code>"));
        assert!(body.contains("<Resource>/b/k</Resource>"));
        assert!(body.contains("<RequestId>"));

        let resp = client.head(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_range_request() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/k", cluster.gateway_url);

        client.put(&url).body("0123456789").send().await.unwrap();

        let resp = client
            .get(&url)
            .header("Range", "bytes=2-5")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 206);
        assert_eq!(resp.headers().get("Content-Range").unwrap(), "bytes 2-5/*");
        assert_eq!(resp.text().await.unwrap(), "2345");

        let resp = client
            .get(&url)
            .header("Range", "bytes=99-200")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 416);
    }

    #[tokio::test]
    async fn test_bad_digest_rejected_and_object_absent() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/k", cluster.gateway_url);

        let resp = client
            .put(&url)
            .header("Content-MD5", "deadbeefdeadbeefdeadbeefdeadbeef")
            .body("abc")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(resp.text().await.unwrap().contains("<Code>BadDigest</Code>"));

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_multipart_upload_flow() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let base = format!("{}/b/mp-key", cluster.gateway_url);

        let resp = client
            .post(format!("{base}?uploads"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let upload_id = extract_tag(&resp.text().await.unwrap(), "UploadId").unwrap();

        let part1 = vec![0x41u8; 5 * 1024 * 1024];
        let resp = client
            .put(format!("{base}?partNumber=1&uploadId={upload_id}"))
            .body(part1.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let e1 = resp.headers().get("ETag").unwrap().to_str().unwrap().to_string();

        let resp = client
            .put(format!("{base}?partNumber=2&uploadId={upload_id}"))
            .body("tail")
            .send()
            .await
            .unwrap();
        let e2 = resp.headers().get("ETag").unwrap().to_str().unwrap().to_string();

        // Out-of-order completion is rejected and the upload survives
        let bad = format!(
            "<CompleteMultipartUpload><Part><PartNumber>2</PartNumber><ETag>{e2}</ETag></Part><Part><PartNumber>1</PartNumber><ETag>{e1}</ETag></Part></CompleteMultipartUpload>"
        );
        let resp = client
            .post(format!("{base}?uploadId={upload_id}"))
            .body(bad)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(resp
            .text()
            .await
            .unwrap()
            .contains("<Code>InvalidPartOrder</Code>"));

        let good = format!(
            "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>{e1}</ETag></Part><Part><PartNumber>2</PartNumber><ETag>{e2}</ETag></Part></CompleteMultipartUpload>"
        );
        let resp = client
            .post(format!("{base}?uploadId={upload_id}"))
            .body(good)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        let final_etag = extract_tag(&body, "ETag").unwrap();
        assert!(final_etag.ends_with("-2\""), "composite etag: {final_etag}");

        let resp = client.get(&base).send().await.unwrap();
        let data = resp.bytes().await.unwrap();
        assert_eq!(data.len(), part1.len() + 4);
        assert_eq!(&data[..part1.len()], &part1[..]);
        assert_eq!(&data[part1.len()..], b"tail");
    }

    #[tokio::test]
    async fn test_multipart_abort() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let base = format!("{}/b/aborted", cluster.gateway_url);

        let resp = client.post(format!("{base}?uploads")).send().await.unwrap();
        let upload_id = extract_tag(&resp.text().await.unwrap(), "UploadId").unwrap();

        let resp = client
            .delete(format!("{base}?uploadId={upload_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        // The upload is gone
        let resp = client
            .put(format!("{base}?partNumber=1&uploadId={upload_id}"))
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/hot", cluster.gateway_url);

        client.put(&url).body("popular bytes").send().await.unwrap();
        // Let the post-put repair pass finish before counting reads
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_put = cluster.node_gets.load(Ordering::SeqCst);

        let mut requests = Vec::new();
        for _ in 0..100 {
            let client = client.clone();
            let url = url.clone();
            requests.push(tokio::spawn(async move {
                client.get(&url).send().await.unwrap().bytes().await.unwrap()
            }));
        }
        for request in requests {
            assert_eq!(request.await.unwrap(), &b"popular bytes"[..]);
        }

        // One coalesced backend fetch fans out to at most N replicas;
        // allow one raced straggler before the cache fills.
        let fetched = cluster.node_gets.load(Ordering::SeqCst) - after_put;
        assert!(fetched <= 6, "expected coalesced fetches, saw {fetched} node GETs");
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_reads() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/k", cluster.gateway_url);

        client.put(&url).body("v1").send().await.unwrap();
        assert_eq!(
            client.get(&url).send().await.unwrap().text().await.unwrap(),
            "v1"
        );

        client.put(&url).body("v2").send().await.unwrap();
        assert_eq!(
            client.get(&url).send().await.unwrap().text().await.unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn test_list_objects_v2_with_delimiter() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();

        for key in ["top", "x/1", "x/2"] {
            client
                .put(format!("{}/bkt/{key}", cluster.gateway_url))
                .body("v")
                .send()
                .await
                .unwrap();
        }

        let resp = client
            .get(format!(
                "{}/bkt?list-type=2&delimiter=/",
                cluster.gateway_url
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Name>bkt</Name>"));
        assert!(body.contains("<Key>top</Key>"));
        assert!(body.contains("<Prefix>x/</Prefix>"));
        assert!(!body.contains("<Key>x/1</Key>"));
        assert!(body.contains("<KeyCount>2</KeyCount>"));
        assert!(body.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[tokio::test]
    async fn test_list_objects_v2_pagination() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();

        for i in 0..5 {
            client
                .put(format!("{}/bkt/key-{i}", cluster.gateway_url))
                .body("v")
                .send()
                .await
                .unwrap();
        }

        let resp = client
            .get(format!("{}/bkt?list-type=2&max-keys=2", cluster.gateway_url))
            .send()
            .await
            .unwrap();
        let body = resp.text().await.unwrap();
        assert!(body.contains("<IsTruncated>true</IsTruncated>"));
        let token = extract_tag(&body, "NextContinuationToken").unwrap();
        assert_eq!(token, "key-1");

        let resp = client
            .get(format!(
                "{}/bkt?list-type=2&max-keys=10&continuation-token={token}",
                cluster.gateway_url
            ))
            .send()
            .await
            .unwrap();
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Key>key-2</Key>"));
        assert!(!body.contains("<Key>key-1</Key>"));
        assert!(body.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[tokio::test]
    async fn test_auth_token_enforced() {
        let cluster =
            start_cluster_with(3, StoragePolicy::Replication, Some("secret".into())).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/k", cluster.gateway_url);

        let resp = client.put(&url).body("x").send().await.unwrap();
        assert_eq!(resp.status(), 403);
        assert!(resp.text().await.unwrap().contains("<Code>AccessDenied</Code>"));

        let resp = client
            .put(&url)
            .bearer_auth("secret")
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Health short-circuits ahead of auth
        let resp = client
            .get(format!("{}/health", cluster.gateway_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_health_ready_debug_endpoints() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();

        for (path, expected) in [("/health", "OK"), ("/ready", "READY")] {
            let resp = client
                .get(format!("{}{path}", cluster.gateway_url))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.text().await.unwrap(), expected);
        }

        client
            .put(format!("{}/b/k", cluster.gateway_url))
            .body("x")
            .send()
            .await
            .unwrap();
        let vars = client
            .get(format!("{}/debug/vars", cluster.gateway_url))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(vars.contains("requests_total{op=\"PutObject\"} 1"));
        assert!(vars.contains("limiter_max_tokens"));
        assert!(vars.contains("cache_data_items"));
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let cluster = start_cluster(3, StoragePolicy::Replication).await;
        let client = reqwest::Client::new();

        let resp = client
            .patch(format!("{}/b/k", cluster.gateway_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
        assert!(resp
            .text()
            .await
            .unwrap()
            .contains("<Code>MethodNotAllowed</Code>"));
    }

    #[tokio::test]
    async fn test_ec_policy_end_to_end() {
        let cluster = start_cluster(6, StoragePolicy::ErasureCoding).await;
        let client = reqwest::Client::new();
        let url = format!("{}/b/ec-obj", cluster.gateway_url);

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
        let resp = client.put(&url).body(payload.clone()).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.bytes().await.unwrap(), payload);

        let resp = client
            .get(&url)
            .header("Range", "bytes=100-199")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 206);
        assert_eq!(resp.bytes().await.unwrap(), &payload[100..200]);

        let resp = client.head(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("Content-Length").unwrap().to_str().unwrap(),
            payload.len().to_string()
        );

        let resp = client.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 204);
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }
}
