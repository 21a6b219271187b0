//! HTTP client for a single storage node
//!
//! Speaks the node's object protocol: `/{bucket}/{key}` for object
//! operations and `/{bucket}?list=1&prefix=&marker=&limit=` for the
//! internal JSON listing. An optional shared-secret bearer token is
//! attached to every request.

use crate::backend::{Backend, GetObject};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;
use strata_common::{Error, HeadResult, ObjectInfo, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one storage node
pub struct HttpNode {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpNode {
    /// Create a client with pooled connections and request timeouts
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn header_string(resp: &reqwest::Response, name: header::HeaderName) -> String {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl Backend for HttpNode {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String> {
        let mut req = self
            .client
            .put(self.object_url(bucket, key))
            .header(header::CONTENT_TYPE, content_type)
            .body(data);
        if let Some(md5) = content_md5 {
            req = req.header("Content-MD5", md5);
        }

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::node(format!("PUT {}: {e}", self.base_url)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            if status == StatusCode::BAD_REQUEST && body.contains("BadDigest") {
                return Err(Error::BadDigest {
                    expected: content_md5.unwrap_or_default().to_string(),
                    actual: String::new(),
                });
            }
            return Err(Error::node(format!(
                "PUT {}/{bucket}/{key} failed: {status} {body}",
                self.base_url
            )));
        }

        Ok(Self::header_string(&resp, header::ETAG))
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> Result<GetObject> {
        let mut req = self.client.get(self.object_url(bucket, key));
        if let Some(spec) = range {
            req = req.header(header::RANGE, spec);
        }

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::node(format!("GET {}: {e}", self.base_url)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::no_such_key(bucket, key));
        }
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(Error::InvalidRange(range.unwrap_or_default().to_string()));
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::node(format!(
                "GET {}/{bucket}/{key} failed: {status}",
                self.base_url
            )));
        }

        let content_type = Self::header_string(&resp, header::CONTENT_TYPE);
        let etag = Self::header_string(&resp, header::ETAG);
        let content_range = resp
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let data = resp
            .bytes()
            .await
            .map_err(|e| Error::node(format!("GET {} body: {e}", self.base_url)))?;

        Ok(GetObject {
            data,
            content_type,
            etag,
            status: status.as_u16(),
            content_range,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>> {
        let resp = self
            .authorize(self.client.head(self.object_url(bucket, key)))
            .send()
            .await
            .map_err(|e| Error::node(format!("HEAD {}: {e}", self.base_url)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let size = resp
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(HeadResult {
                    content_type: Self::header_string(&resp, header::CONTENT_TYPE),
                    etag: Self::header_string(&resp, header::ETAG),
                    size,
                }))
            }
            status => Err(Error::node(format!(
                "HEAD {}/{bucket}/{key} failed: {status}",
                self.base_url
            ))),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let resp = self
            .authorize(self.client.delete(self.object_url(bucket, key)))
            .send()
            .await
            .map_err(|e| Error::node(format!("DELETE {}: {e}", self.base_url)))?;

        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::node(format!(
                "DELETE {}/{bucket}/{key} failed: {status}",
                self.base_url
            ))),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>> {
        let url = format!("{}/{}", self.base_url, bucket);
        let limit = limit.to_string();
        let req = self.client.get(url).query(&[
            ("list", "1"),
            ("prefix", prefix),
            ("marker", marker),
            ("limit", limit.as_str()),
        ]);

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::node(format!("LIST {}: {e}", self.base_url)))?;

        if resp.status() != StatusCode::OK {
            return Err(Error::node(format!(
                "LIST {}/{bucket} failed: {}",
                self.base_url,
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::node(format!("LIST {} body: {e}", self.base_url)))?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::node(format!("LIST {} decode: {e}", self.base_url)))
    }
}
