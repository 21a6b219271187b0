//! The gateway cache tier
//!
//! One byte-budgeted TTL+LRU cache implementation backs four typed caches:
//! object metadata, small-object data, list results, and head results.
//! Every successful write invalidates the object's entries and bumps the
//! bucket's list generation so stale list fingerprints can never hit again.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::config::CacheConfig;
use strata_common::{HeadResult, ObjectInfo};

struct Entry<V> {
    value: V,
    size: u64,
    expires_at: Instant,
    access: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    current_bytes: u64,
    clock: u64,
}

/// TTL + LRU cache with a byte budget
pub struct Cache<V: Clone> {
    inner: Mutex<Inner<V>>,
    max_bytes: u64,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub items: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl<V: Clone> Cache<V> {
    #[must_use]
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                current_bytes: 0,
                clock: 0,
            }),
            max_bytes,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            // Drop it now rather than waiting for the sweeper
            if let Some(old) = inner.entries.remove(key) {
                inner.current_bytes -= old.size;
            }
            drop(inner);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(key).expect("entry observed above");
        entry.access = clock;
        let value = entry.value.clone();
        drop(inner);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    pub fn set(&self, key: &str, value: V, size: u64) {
        if size > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(old) = inner.entries.remove(key) {
            inner.current_bytes -= old.size;
        }

        while inner.current_bytes + size > self.max_bytes {
            let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(old) = inner.entries.remove(&lru_key) {
                inner.current_bytes -= old.size;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        inner.current_bytes += size;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                size,
                expires_at: Instant::now() + self.ttl,
                access: clock,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(key) {
            inner.current_bytes -= old.size;
        }
    }

    /// Drop every expired entry; the background sweeper calls this once a
    /// minute
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(old) = inner.entries.remove(&key) {
                inner.current_bytes -= old.size;
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            items: inner.entries.len(),
            bytes: inner.current_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A cached small object: payload plus the headers needed to serve it
#[derive(Clone, Debug)]
pub struct CachedObject {
    pub data: Bytes,
    pub content_type: String,
    pub etag: String,
}

/// The four gateway caches plus per-bucket list generations
pub struct CacheTier {
    enabled: bool,
    metadata: Cache<Option<HeadResult>>,
    data: Cache<CachedObject>,
    list: Cache<Arc<Vec<ObjectInfo>>>,
    head: Cache<Option<HeadResult>>,
    max_object_bytes: u64,
    list_generations: Mutex<HashMap<String, u64>>,
}

impl CacheTier {
    #[must_use]
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            metadata: Cache::new(cfg.metadata_bytes, cfg.ttl),
            data: Cache::new(cfg.data_bytes, cfg.ttl),
            list: Cache::new(cfg.list_bytes, cfg.list_ttl),
            head: Cache::new(cfg.metadata_bytes / 2, cfg.ttl),
            max_object_bytes: cfg.max_object_bytes,
            list_generations: Mutex::new(HashMap::new()),
        }
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    pub fn get_data(&self, bucket: &str, key: &str) -> Option<CachedObject> {
        if !self.enabled {
            return None;
        }
        self.data.get(&Self::object_key(bucket, key))
    }

    /// Cache a small object; larger payloads are ignored. The bytes are
    /// copied so later slicing of the source cannot alias the entry.
    pub fn set_data(&self, bucket: &str, key: &str, object: &CachedObject) {
        if !self.enabled || object.data.len() as u64 > self.max_object_bytes {
            return;
        }
        let copied = CachedObject {
            data: Bytes::copy_from_slice(&object.data),
            content_type: object.content_type.clone(),
            etag: object.etag.clone(),
        };
        let size = copied.data.len() as u64;
        self.data.set(&Self::object_key(bucket, key), copied, size);
    }

    pub fn get_metadata(&self, bucket: &str, key: &str) -> Option<Option<HeadResult>> {
        if !self.enabled {
            return None;
        }
        self.metadata.get(&Self::object_key(bucket, key))
    }

    pub fn set_metadata(&self, bucket: &str, key: &str, head: Option<HeadResult>) {
        if !self.enabled {
            return;
        }
        // Flat estimate; metadata entries are small and uniform
        self.metadata.set(&Self::object_key(bucket, key), head, 200);
    }

    pub fn get_head(&self, bucket: &str, key: &str) -> Option<Option<HeadResult>> {
        if !self.enabled {
            return None;
        }
        self.head.get(&Self::object_key(bucket, key))
    }

    pub fn set_head(&self, bucket: &str, key: &str, head: Option<HeadResult>) {
        if !self.enabled {
            return;
        }
        self.head.set(&Self::object_key(bucket, key), head, 200);
    }

    /// Fingerprint for one list query, bound to the bucket's current
    /// generation
    #[must_use]
    pub fn list_fingerprint(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> String {
        let generation = *self.list_generations.lock().entry(bucket.to_string()).or_default();
        format!("{bucket}@{generation}|{prefix}|{marker}|{max_keys}")
    }

    pub fn get_list(&self, fingerprint: &str) -> Option<Arc<Vec<ObjectInfo>>> {
        if !self.enabled {
            return None;
        }
        self.list.get(fingerprint)
    }

    pub fn set_list(&self, fingerprint: &str, objects: Arc<Vec<ObjectInfo>>) {
        if !self.enabled {
            return;
        }
        let size: u64 = objects
            .iter()
            .map(|o| (o.key.len() + o.etag.len() + o.content_type.len() + 64) as u64)
            .sum();
        self.list.set(fingerprint, objects, size.max(64));
    }

    /// Write-path invalidation: remove the object's entries and mark the
    /// bucket's list results stale
    pub fn invalidate_object(&self, bucket: &str, key: &str) {
        if !self.enabled {
            return;
        }
        let object_key = Self::object_key(bucket, key);
        self.metadata.remove(&object_key);
        self.data.remove(&object_key);
        self.head.remove(&object_key);
        *self
            .list_generations
            .lock()
            .entry(bucket.to_string())
            .or_default() += 1;
    }

    pub fn sweep_expired(&self) {
        if !self.enabled {
            return;
        }
        self.metadata.sweep_expired();
        self.data.sweep_expired();
        self.list.sweep_expired();
        self.head.sweep_expired();
    }

    /// Counter lines for the debug endpoint
    #[must_use]
    pub fn export_text(&self) -> String {
        let mut out = String::with_capacity(512);
        for (name, stats) in [
            ("metadata", self.metadata.stats()),
            ("data", self.data.stats()),
            ("list", self.list.stats()),
            ("head", self.head.stats()),
        ] {
            let _ = writeln!(
                out,
                "cache_{name}_items {}\ncache_{name}_bytes {}\ncache_{name}_hits {}\ncache_{name}_misses {}\ncache_{name}_evictions {}",
                stats.items, stats.bytes, stats.hits, stats.misses, stats.evictions
            );
        }
        out
    }
}
