//! The storage-node role
//!
//! A thin HTTP shell over [`LocalStore`]: object PUT/GET/HEAD/DELETE under
//! `/{bucket}/{key}` plus the internal JSON listing endpoint the gateway
//! and repair loop use (`GET /{bucket}?list=1`).

use crate::util::{parse_query, split_object_path};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::TryStreamExt;
use std::sync::Arc;
use strata_common::config::NodeConfig;
use strata_common::{Error, Result};
use strata_s3::error::escape_xml;
use strata_store::LocalStore;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

struct NodeService {
    store: LocalStore,
    auth_token: Option<String>,
}

/// Build the node router over an opened store
pub(crate) fn router(store: LocalStore, auth_token: Option<String>, max_body: usize) -> Router {
    let service = Arc::new(NodeService { store, auth_token });
    Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Run the storage node until ctrl-c
pub async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    info!(listen = cfg.listen, data_dir = %cfg.data_dir.display(), "starting storage node");

    let store = LocalStore::open(&cfg.data_dir)?;
    let app = router(store, cfg.auth_token.clone(), cfg.max_body);

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    info!(addr = cfg.listen, "node server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down node");
        })
        .await?;

    Ok(())
}

async fn handle(State(service): State<Arc<NodeService>>, req: Request) -> Response {
    if req.uri().path() == "/health" {
        return text_response(StatusCode::OK, "OK");
    }

    if let Some(token) = &service.auth_token {
        let authorized = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {token}"));
        if !authorized {
            return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let query = parse_query(req.uri().query().unwrap_or(""));
    let (bucket, key) = split_object_path(req.uri().path());

    if query.contains_key("list") && req.method() == Method::GET {
        return handle_list(&service, &bucket, &query).await;
    }

    if bucket.is_empty() || key.is_empty() {
        return error_xml_response(StatusCode::BAD_REQUEST, "InvalidURI", "invalid path");
    }

    match req.method().as_str() {
        "PUT" => handle_put(&service, &bucket, &key, req).await,
        "GET" => handle_get(&service, &bucket, &key, req).await,
        "HEAD" => handle_head(&service, &bucket, &key).await,
        "DELETE" => handle_delete(&service, &bucket, &key).await,
        _ => error_xml_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            "method not allowed",
        ),
    }
}

async fn handle_put(service: &NodeService, bucket: &str, key: &str, req: Request) -> Response {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let content_md5 = req
        .headers()
        .get("Content-MD5")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let body = req
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);

    match service
        .store
        .put(bucket, key, Box::pin(body), &content_type, content_md5.as_deref())
        .await
    {
        Ok(object_etag) => Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, object_etag)
            .body(Body::empty())
            .expect("static response"),
        Err(e) => {
            if !matches!(e, Error::BadDigest { .. }) {
                error!(bucket, key, error = %e, "put failed");
            }
            render_error(&e)
        }
    }
}

async fn handle_get(service: &NodeService, bucket: &str, key: &str, req: Request) -> Response {
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match service.store.get(bucket, key, range).await {
        Ok(read) => {
            let mut builder = Response::builder()
                .status(read.status)
                .header(header::CONTENT_TYPE, read.content_type.clone())
                .header(header::ETAG, read.etag.clone())
                .header(header::CONTENT_LENGTH, read.len)
                .header(header::ACCEPT_RANGES, "bytes");
            if let Some(range) = read.range {
                builder = builder.header(header::CONTENT_RANGE, range.content_range());
            }
            builder
                .body(Body::from_stream(ReaderStream::new(read.reader)))
                .expect("static response")
        }
        Err(e) => {
            if !e.is_not_found() && e.http_status_code() != 416 {
                error!(bucket, key, error = %e, "get failed");
            }
            render_error(&e)
        }
    }
}

async fn handle_head(service: &NodeService, bucket: &str, key: &str) -> Response {
    match service.store.head(bucket, key).await {
        Ok(Some(meta)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, meta.content_type)
            .header(header::ETAG, meta.etag)
            .header(header::CONTENT_LENGTH, meta.size)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())
            .expect("static response"),
        Ok(None) => render_error(&Error::no_such_key(bucket, key)),
        Err(e) => {
            error!(bucket, key, error = %e, "head failed");
            render_error(&e)
        }
    }
}

async fn handle_delete(service: &NodeService, bucket: &str, key: &str) -> Response {
    match service.store.delete(bucket, key).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("static response"),
        Err(e) => {
            error!(bucket, key, error = %e, "delete failed");
            render_error(&e)
        }
    }
}

async fn handle_list(
    service: &NodeService,
    bucket: &str,
    query: &std::collections::HashMap<String, String>,
) -> Response {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let marker = query.get("marker").map(String::as_str).unwrap_or("");
    let limit = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(1000);

    match list_json(service, bucket, prefix, marker, limit).await {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("static response"),
        Err(e) => {
            error!(bucket, error = %e, "list failed");
            render_error(&e)
        }
    }
}

async fn list_json(
    service: &NodeService,
    bucket: &str,
    prefix: &str,
    marker: &str,
    limit: usize,
) -> Result<Vec<u8>> {
    let objects = service.store.list(bucket, prefix, marker, limit).await?;
    Ok(serde_json::to_vec(&objects)?)
}

fn render_error(e: &Error) -> Response {
    let status =
        StatusCode::from_u16(e.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_xml_response(status, e.s3_error_code(), &e.to_string())
}

/// The node's error document carries code and message only; the gateway
/// wraps failures in the full S3 form for clients. Messages embed object
/// keys, so both fields go through the shared XML escaper.
fn error_xml_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error>\n  <Code>{}</Code>\n  <Message>{}</Message>\n</Error>",
        escape_xml(code),
        escape_xml(message)
    );
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body))
        .expect("static response")
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response")
}
