//! Multipart upload staging
//!
//! Parts are staged under `<scratch>/multipart-<uploadId>/part-<n>` and the
//! upload itself lives in memory until Complete seals it through the
//! object backend, Abort discards it, or the sweeper expires it.

use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strata_cluster::Backend;
use strata_common::bufpool::{BufferPool, MEDIUM_BUFFER_SIZE};
use strata_common::{etag, Error, Result};
use strata_s3::xml::CompletePart;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

const MIN_PART_NUMBER: u32 = 1;
const MAX_PART_NUMBER: u32 = 10_000;

/// One staged part
#[derive(Clone, Debug)]
pub struct PartInfo {
    pub etag: String,
    pub size: u64,
}

/// An in-progress multipart upload
struct Upload {
    bucket: String,
    key: String,
    created_at: Instant,
    parts: Mutex<HashMap<u32, PartInfo>>,
}

/// Tracks every in-progress upload and stages parts on disk
pub struct MultipartManager {
    uploads: RwLock<HashMap<String, Arc<Upload>>>,
    scratch_dir: PathBuf,
    backend: Arc<dyn Backend>,
    pool: Arc<BufferPool>,
}

impl MultipartManager {
    #[must_use]
    pub fn new(scratch_dir: PathBuf, backend: Arc<dyn Backend>, pool: Arc<BufferPool>) -> Self {
        Self {
            uploads: RwLock::new(HashMap::new()),
            scratch_dir,
            backend,
            pool,
        }
    }

    fn part_dir(&self, upload_id: &str) -> PathBuf {
        self.scratch_dir.join(format!("multipart-{upload_id}"))
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.part_dir(upload_id).join(format!("part-{part_number}"))
    }

    fn lookup(&self, upload_id: &str) -> Result<Arc<Upload>> {
        self.uploads
            .read()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchUpload(upload_id.to_string()))
    }

    /// Start a new upload and create its scratch directory
    pub async fn initiate(&self, bucket: &str, key: &str) -> Result<String> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let upload_id = format!("{nanos}-{}", uuid::Uuid::new_v4().simple());

        fs::create_dir_all(self.part_dir(&upload_id)).await?;

        let upload = Arc::new(Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            created_at: Instant::now(),
            parts: Mutex::new(HashMap::new()),
        });
        self.uploads.write().insert(upload_id.clone(), upload);

        Ok(upload_id)
    }

    /// Stage one part, replacing any prior upload of the same number
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let upload = self.lookup(upload_id)?;
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(Error::InvalidPart { part_number });
        }

        let digest: [u8; 16] = Md5::digest(&data).into();
        let part_etag = etag::quote(&hex::encode(digest));

        let path = self.part_path(upload_id, part_number);
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        upload.parts.lock().insert(
            part_number,
            PartInfo {
                etag: part_etag.clone(),
                size: data.len() as u64,
            },
        );

        Ok(part_etag)
    }

    /// Validate the part list, seal the object through the backend, and
    /// tear the upload down
    ///
    /// Returns the S3 composite ETag. Validation failures leave the upload
    /// intact so the client can retry with a corrected list or abort.
    pub async fn complete(&self, upload_id: &str, parts: &[CompletePart]) -> Result<String> {
        let upload = self.lookup(upload_id)?;
        self.validate_parts(&upload, parts)?;

        let final_path = self.scratch_dir.join(format!("complete-{upload_id}"));
        let concat_result = self.concatenate(upload_id, parts, &final_path).await;
        let (final_etag, payload) = match concat_result {
            Ok(sealed) => sealed,
            Err(e) => {
                let _ = fs::remove_file(&final_path).await;
                return Err(e);
            }
        };

        let put_result = self
            .backend
            .put(
                &upload.bucket,
                &upload.key,
                payload,
                "application/octet-stream",
                None,
            )
            .await;
        let _ = fs::remove_file(&final_path).await;
        put_result?;

        self.uploads.write().remove(upload_id);
        self.cleanup(upload_id).await;

        Ok(final_etag)
    }

    /// Concatenate the staged parts, re-hashing each, and compute the
    /// composite ETag
    async fn concatenate(
        &self,
        upload_id: &str,
        parts: &[CompletePart],
        final_path: &std::path::Path,
    ) -> Result<(String, Bytes)> {
        let mut final_file = fs::File::create(final_path).await?;
        let mut part_digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
        let mut buf = self.pool.get(MEDIUM_BUFFER_SIZE);

        for part in parts {
            let mut part_file = fs::File::open(self.part_path(upload_id, part.part_number)).await?;
            let mut hasher = Md5::new();
            loop {
                let n = part_file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                final_file.write_all(&buf[..n]).await?;
            }
            part_digests.push(hasher.finalize().into());
        }
        self.pool.put(buf);
        final_file.flush().await?;
        drop(final_file);

        let final_etag = etag::composite_etag(&part_digests);
        let payload = Bytes::from(fs::read(final_path).await?);
        Ok((final_etag, payload))
    }

    fn validate_parts(&self, upload: &Upload, parts: &[CompletePart]) -> Result<()> {
        if parts.is_empty() {
            return Err(Error::InvalidPart { part_number: 0 });
        }

        let stored = upload.parts.lock();
        let mut prev = 0u32;
        for part in parts {
            if part.part_number <= prev {
                // Covers both out-of-order and duplicate numbers
                if parts.iter().filter(|p| p.part_number == part.part_number).count() > 1 {
                    return Err(Error::InvalidPart {
                        part_number: part.part_number,
                    });
                }
                return Err(Error::InvalidPartOrder);
            }
            let Some(info) = stored.get(&part.part_number) else {
                return Err(Error::InvalidPart {
                    part_number: part.part_number,
                });
            };
            if info.etag != part.etag {
                return Err(Error::InvalidPart {
                    part_number: part.part_number,
                });
            }
            prev = part.part_number;
        }
        Ok(())
    }

    /// Drop the upload and its scratch directory
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        self.uploads.write().remove(upload_id);
        self.cleanup(upload_id).await;
        Ok(())
    }

    /// Remove uploads older than `ttl`
    pub fn sweep_stale(self: &Arc<Self>, ttl: Duration) {
        let stale: Vec<String> = {
            let uploads = self.uploads.read();
            uploads
                .iter()
                .filter(|(_, u)| u.created_at.elapsed() > ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };

        if stale.is_empty() {
            return;
        }

        let mut uploads = self.uploads.write();
        for id in stale {
            if let Some(upload) = uploads.remove(&id) {
                info!(
                    upload_id = id,
                    bucket = upload.bucket,
                    key = upload.key,
                    age_secs = upload.created_at.elapsed().as_secs(),
                    "sweeping stale multipart upload"
                );
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.cleanup(&id).await });
            }
        }
    }

    /// Number of in-progress uploads
    #[must_use]
    pub fn active_uploads(&self) -> usize {
        self.uploads.read().len()
    }

    async fn cleanup(&self, upload_id: &str) {
        if let Err(e) = fs::remove_dir_all(self.part_dir(upload_id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(upload_id, error = %e, "multipart scratch cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strata_common::{HeadResult, ObjectInfo};
    use tempfile::TempDir;

    /// Backend double recording the sealed object
    #[derive(Default)]
    struct RecordingBackend {
        objects: Mutex<HashMap<String, (Bytes, String)>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn put(
            &self,
            bucket: &str,
            key: &str,
            data: Bytes,
            content_type: &str,
            _content_md5: Option<&str>,
        ) -> Result<String> {
            let object_etag = etag::etag_of(&data);
            self.objects
                .lock()
                .insert(format!("{bucket}/{key}"), (data, content_type.to_string()));
            Ok(object_etag)
        }

        async fn get(
            &self,
            bucket: &str,
            key: &str,
            _range: Option<&str>,
        ) -> Result<strata_cluster::GetObject> {
            Err(Error::no_such_key(bucket, key))
        }

        async fn head(&self, _bucket: &str, _key: &str) -> Result<Option<HeadResult>> {
            Ok(None)
        }

        async fn delete(&self, _bucket: &str, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn list(
            &self,
            _bucket: &str,
            _prefix: &str,
            _marker: &str,
            _limit: usize,
        ) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }
    }

    fn manager() -> (TempDir, Arc<MultipartManager>, Arc<RecordingBackend>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let manager = Arc::new(MultipartManager::new(
            dir.path().to_path_buf(),
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::new(BufferPool::new()),
        ));
        (dir, manager, backend)
    }

    fn complete_part(part_number: u32, etag: &str) -> CompletePart {
        CompletePart {
            part_number,
            etag: etag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let (_dir, manager, backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();

        let part1 = vec![0x41u8; 5 * 1024 * 1024];
        let e1 = manager
            .upload_part(&upload_id, 1, Bytes::from(part1.clone()))
            .await
            .unwrap();
        let e2 = manager
            .upload_part(&upload_id, 2, Bytes::from_static(b"tail"))
            .await
            .unwrap();

        let final_etag = manager
            .complete(&upload_id, &[complete_part(1, &e1), complete_part(2, &e2)])
            .await
            .unwrap();

        // Composite form: MD5 over the raw part digests, dash, part count
        let d1: [u8; 16] = Md5::digest(&part1).into();
        let d2: [u8; 16] = Md5::digest(b"tail").into();
        assert_eq!(final_etag, etag::composite_etag(&[d1, d2]));
        assert!(final_etag.ends_with("-2\""));

        let objects = backend.objects.lock();
        let (data, content_type) = &objects["b/k"];
        assert_eq!(data.len(), part1.len() + 4);
        assert_eq!(&data[..part1.len()], &part1[..]);
        assert_eq!(&data[part1.len()..], b"tail");
        assert_eq!(content_type, "application/octet-stream");

        assert_eq!(manager.active_uploads(), 0);
    }

    #[tokio::test]
    async fn test_part_replacement_keeps_latest() {
        let (_dir, manager, backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();

        manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"old"))
            .await
            .unwrap();
        let e1 = manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"new"))
            .await
            .unwrap();

        manager
            .complete(&upload_id, &[complete_part(1, &e1)])
            .await
            .unwrap();
        assert_eq!(backend.objects.lock()["b/k"].0, &b"new"[..]);
    }

    #[tokio::test]
    async fn test_part_number_bounds() {
        let (_dir, manager, _backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();

        for bad in [0u32, 10_001] {
            let err = manager
                .upload_part(&upload_id, bad, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.s3_error_code(), "InvalidPart");
        }
    }

    #[tokio::test]
    async fn test_complete_out_of_order_rejected() {
        let (_dir, manager, _backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();
        let e1 = manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let e2 = manager
            .upload_part(&upload_id, 2, Bytes::from_static(b"b"))
            .await
            .unwrap();

        let err = manager
            .complete(&upload_id, &[complete_part(2, &e2), complete_part(1, &e1)])
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "InvalidPartOrder");

        // The upload survives a failed Complete
        assert_eq!(manager.active_uploads(), 1);
    }

    #[tokio::test]
    async fn test_complete_duplicate_part_rejected() {
        let (_dir, manager, _backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();
        let e1 = manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();

        let err = manager
            .complete(&upload_id, &[complete_part(1, &e1), complete_part(1, &e1)])
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "InvalidPart");
    }

    #[tokio::test]
    async fn test_complete_validates_etags_and_presence() {
        let (_dir, manager, _backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();
        let e1 = manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();

        let err = manager
            .complete(&upload_id, &[complete_part(1, "\"wrong\"")])
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "InvalidPart");

        let err = manager
            .complete(&upload_id, &[complete_part(1, &e1), complete_part(3, "\"x\"")])
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "InvalidPart");

        let err = manager.complete(&upload_id, &[]).await.unwrap_err();
        assert_eq!(err.s3_error_code(), "InvalidPart");
    }

    #[tokio::test]
    async fn test_unknown_upload() {
        let (_dir, manager, _backend) = manager();
        let err = manager
            .upload_part("missing", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "NoSuchUpload");

        let err = manager
            .complete("missing", &[complete_part(1, "\"e\"")])
            .await
            .unwrap_err();
        assert_eq!(err.s3_error_code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_abort_removes_upload_and_scratch() {
        let (dir, manager, _backend) = manager();
        let upload_id = manager.initiate("b", "k").await.unwrap();
        manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        manager.abort(&upload_id).await.unwrap();
        assert_eq!(manager.active_uploads(), 0);
        assert!(!dir.path().join(format!("multipart-{upload_id}")).exists());

        // Abort of an unknown id is not an error
        manager.abort("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_expires_old_uploads() {
        let (_dir, manager, _backend) = manager();
        manager.initiate("b", "k").await.unwrap();
        assert_eq!(manager.active_uploads(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.sweep_stale(Duration::ZERO);
        assert_eq!(manager.active_uploads(), 0);

        // Fresh uploads survive a sweep with a generous TTL
        manager.initiate("b", "k2").await.unwrap();
        manager.sweep_stale(Duration::from_secs(3600));
        assert_eq!(manager.active_uploads(), 1);
    }
}
