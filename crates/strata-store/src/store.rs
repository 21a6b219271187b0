//! The local filesystem object store

use bytes::Bytes;
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::range::{parse_range, ByteRange};
use strata_common::{etag, Error, ObjectInfo, ObjectMeta, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Suffix of the per-object metadata sidecar
pub const META_SUFFIX: &str = ".meta.json";

/// Prefix of in-flight temp files; anything carrying it is not an object
const TMP_PREFIX: &str = ".tmp-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Durable object store over a data directory this process exclusively owns
pub struct LocalStore {
    root: PathBuf,
}

/// An open object ready to stream, bounded to the requested range
#[derive(Debug)]
pub struct ObjectRead {
    pub reader: tokio::io::Take<fs::File>,
    pub content_type: String,
    pub etag: String,
    /// Number of bytes the reader will yield
    pub len: u64,
    /// 200 for whole-object reads, 206 for ranges
    pub status: u16,
    pub range: Option<ByteRange>,
}

impl ObjectRead {
    /// Drain the reader into memory
    pub async fn read_to_bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl LocalStore {
    /// Open (or create) the data directory and sweep orphaned temp files
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let store = Self { root };
        store.sweep_orphaned_tmp();
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_component(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    fn meta_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        self.object_path(bucket, &format!("{key}{META_SUFFIX}"))
    }

    /// Store an object with the durable write protocol
    ///
    /// Temp file in the target directory, running MD5 over the copy, fsync,
    /// Content-MD5 check, sidecar write, rename, parent-directory fsync. A
    /// reader either sees the previous object (or none) or the new one in
    /// full, never a torn mix.
    pub async fn put<S>(
        &self,
        bucket: &str,
        key: &str,
        mut body: S,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let obj_path = self.object_path(bucket, key)?;
        let meta_path = self.meta_path(bucket, key)?;
        let parent = obj_path
            .parent()
            .ok_or_else(|| Error::internal("object path has no parent"))?
            .to_path_buf();

        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(
            "{TMP_PREFIX}{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut tmp = fs::File::create(&tmp_path).await?;

        let mut hasher = Md5::new();
        let mut size: u64 = 0;
        let write_result: Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                size += chunk.len() as u64;
                tmp.write_all(&chunk).await?;
            }
            tmp.sync_all().await?;
            Ok(())
        }
        .await;

        drop(tmp);
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let digest: [u8; 16] = hasher.finalize().into();
        let hex_digest = hex::encode(digest);

        if let Some(supplied) = content_md5 {
            if !md5_header_matches(supplied, &digest, &hex_digest) {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(Error::BadDigest {
                    expected: supplied.to_string(),
                    actual: hex_digest,
                });
            }
        }

        let object_etag = etag::quote(&hex_digest);
        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            etag: object_etag.clone(),
            size,
        };
        let meta_bytes = serde_json::to_vec(&meta)?;
        if let Err(e) = fs::write(&meta_path, meta_bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&tmp_path, &obj_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        // Durability of the rename itself
        if let Ok(dir) = fs::File::open(&parent).await {
            let _ = dir.sync_all().await;
        }

        debug!(bucket, key, size, "stored object");
        Ok(object_etag)
    }

    /// Convenience wrapper for in-memory payloads
    pub async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        content_md5: Option<&str>,
    ) -> Result<String> {
        let stream = futures::stream::iter([Ok(data)]);
        self.put(bucket, key, Box::pin(stream), content_type, content_md5)
            .await
    }

    /// Open an object for reading, bounded to `range` when supplied
    pub async fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> Result<ObjectRead> {
        let meta = self
            .head(bucket, key)
            .await?
            .ok_or_else(|| Error::no_such_key(bucket, key))?;

        let obj_path = self.object_path(bucket, key)?;
        let mut file = match fs::File::open(&obj_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::no_such_key(bucket, key));
            }
            Err(e) => return Err(e.into()),
        };

        match range {
            Some(spec) => {
                let range = parse_range(spec, meta.size)?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                Ok(ObjectRead {
                    reader: file.take(range.len()),
                    content_type: meta.content_type,
                    etag: meta.etag,
                    len: range.len(),
                    status: 206,
                    range: Some(range),
                })
            }
            None => Ok(ObjectRead {
                reader: file.take(meta.size),
                content_type: meta.content_type,
                etag: meta.etag,
                len: meta.size,
                status: 200,
                range: None,
            }),
        }
    }

    /// Read the sidecar; `None` when the object does not exist
    pub async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let meta_path = self.meta_path(bucket, key)?;
        let raw = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Best-effort idempotent removal; absence is success
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let obj_path = self.object_path(bucket, key)?;
        let meta_path = self.meta_path(bucket, key)?;
        let _ = fs::remove_file(&obj_path).await;
        let _ = fs::remove_file(&meta_path).await;
        Ok(())
    }

    /// List objects lexicographically, filtered by prefix and marker
    ///
    /// Entries strictly greater than `marker` are returned, at most `limit`.
    /// An empty bucket name walks the whole data root and yields keys of the
    /// form `bucket/key`; the repair loop scans nodes this way.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>> {
        let bucket_path = if bucket.is_empty() {
            self.root.clone()
        } else {
            validate_component(bucket)?;
            self.root.join(bucket)
        };
        let prefix = prefix.to_string();
        let marker = marker.to_string();

        let results = tokio::task::spawn_blocking(move || {
            walk_bucket(&bucket_path, &prefix, &marker, limit)
        })
        .await
        .map_err(|e| Error::internal(format!("list task failed: {e}")))??;

        Ok(results)
    }

    /// Remove temp files left behind by a crash mid-put
    fn sweep_orphaned_tmp(&self) {
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TMP_PREFIX))
                {
                    warn!(path = %path.display(), "removing orphaned temp file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}

/// Synchronous bucket walk used from a blocking task
fn walk_bucket(
    bucket_path: &Path,
    prefix: &str,
    marker: &str,
    limit: usize,
) -> Result<Vec<ObjectInfo>> {
    let mut results = Vec::new();
    if !bucket_path.is_dir() {
        return Ok(results);
    }

    let mut stack = vec![bucket_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(META_SUFFIX) || name.starts_with(TMP_PREFIX) {
                continue;
            }

            let Ok(rel) = path.strip_prefix(bucket_path) else {
                continue;
            };
            let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");

            if !prefix.is_empty() && !key.starts_with(prefix) {
                continue;
            }
            if !marker.is_empty() && key.as_str() <= marker {
                continue;
            }

            let meta_path = dir.join(format!("{name}{META_SUFFIX}"));
            let Ok(raw) = std::fs::read(&meta_path) else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<ObjectMeta>(&raw) else {
                continue;
            };

            let last_modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| {
                    chrono::DateTime::<chrono::Utc>::from(t)
                        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                        .to_string()
                })
                .unwrap_or_default();

            results.push(ObjectInfo {
                key,
                size: meta.size,
                last_modified,
                etag: meta.etag,
                content_type: meta.content_type,
            });
        }
    }

    results.sort_by(|a, b| a.key.cmp(&b.key));
    results.truncate(limit);
    Ok(results)
}

/// A supplied Content-MD5 matches if it equals the computed digest in
/// either the base64 header form or raw hex
fn md5_header_matches(supplied: &str, digest: &[u8; 16], hex_digest: &str) -> bool {
    use base64::Engine as _;
    if supplied == hex_digest {
        return true;
    }
    base64::engine::general_purpose::STANDARD
        .decode(supplied)
        .is_ok_and(|raw| raw == digest)
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidUri(format!("invalid bucket name {name:?}")));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidUri("empty object key".into()));
    }
    if key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(Error::InvalidUri(format!("invalid object key {key:?}")));
    }
    Ok(())
}
