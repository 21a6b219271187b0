//! Adaptive token-bucket admission control
//!
//! A token bucket whose capacity tracks observed service health: heavy
//! error rates shrink it, sustained good latency grows it, always clamped
//! to the configured floor and ceiling. The refill rate follows the
//! capacity. A per-bucket variant maintains one independent limiter per
//! S3 bucket.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::config::LimiterConfig;

/// Poll interval for `wait`
const WAIT_POLL: Duration = Duration::from_millis(10);

struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

/// Token bucket with adaptive capacity
pub struct AdaptiveLimiter {
    bucket: Mutex<Bucket>,
    min_rate: f64,
    max_rate: f64,
    allowed: AtomicU64,
    rejected: AtomicU64,
    adaptations: AtomicU64,
}

/// Snapshot of limiter state
#[derive(Clone, Copy, Debug)]
pub struct LimiterStats {
    pub max_tokens: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub adaptations: u64,
}

impl AdaptiveLimiter {
    #[must_use]
    pub fn new(initial_rate: u64, min_rate: u64, max_rate: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: initial_rate as f64,
                max_tokens: initial_rate as f64,
                refill_rate: initial_rate as f64,
                last_refill: Instant::now(),
            }),
            min_rate: min_rate as f64,
            max_rate: max_rate as f64,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            adaptations: AtomicU64::new(0),
        }
    }

    /// Take one token if available
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_rate).min(bucket.max_tokens);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            drop(bucket);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            drop(bucket);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Poll `allow` until a token is free or `max_wait` elapses
    pub async fn wait(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.allow() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Grow capacity by `factor`, clamped to the ceiling
    pub fn adapt_up(&self, factor: f64) {
        let mut bucket = self.bucket.lock();
        let target = (bucket.max_tokens * (1.0 + factor)).min(self.max_rate);
        if target > bucket.max_tokens {
            bucket.max_tokens = target;
            bucket.refill_rate = target;
            self.adaptations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Shrink capacity by `factor`, clamped to the floor
    pub fn adapt_down(&self, factor: f64) {
        let mut bucket = self.bucket.lock();
        let target = (bucket.max_tokens * (1.0 - factor)).max(self.min_rate);
        if target < bucket.max_tokens {
            bucket.max_tokens = target;
            bucket.refill_rate = target;
            bucket.tokens = bucket.tokens.min(target);
            self.adaptations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Adapt capacity from recent error rate and p99 latency
    pub fn update_metrics(&self, error_rate: f64, p99: Duration) {
        if error_rate > 0.05 {
            self.adapt_down(0.2);
        } else if error_rate > 0.01 {
            self.adapt_down(0.1);
        } else if error_rate < 0.001 && p99 < Duration::from_millis(100) {
            self.adapt_up(0.1);
        }
    }

    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let max_tokens = self.bucket.lock().max_tokens as u64;
        LimiterStats {
            max_tokens,
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            adaptations: self.adaptations.load(Ordering::Relaxed),
        }
    }
}

/// One independent limiter per bucket, created lazily
pub struct PerBucketLimiter {
    limiters: RwLock<HashMap<String, Arc<AdaptiveLimiter>>>,
    initial_rate: u64,
    min_rate: u64,
    max_rate: u64,
}

impl PerBucketLimiter {
    #[must_use]
    pub fn new(initial_rate: u64, min_rate: u64, max_rate: u64) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            initial_rate,
            min_rate,
            max_rate,
        }
    }

    pub fn get(&self, bucket: &str) -> Arc<AdaptiveLimiter> {
        if let Some(limiter) = self.limiters.read().get(bucket) {
            return Arc::clone(limiter);
        }
        let mut limiters = self.limiters.write();
        Arc::clone(limiters.entry(bucket.to_string()).or_insert_with(|| {
            Arc::new(AdaptiveLimiter::new(
                self.initial_rate,
                self.min_rate,
                self.max_rate,
            ))
        }))
    }

    pub fn update_metrics(&self, error_rate: f64, p99: Duration) {
        for limiter in self.limiters.read().values() {
            limiter.update_metrics(error_rate, p99);
        }
    }
}

/// The gateway's admission surface: a global limiter, optionally one per
/// bucket
pub struct LimiterSet {
    enabled: bool,
    global: Arc<AdaptiveLimiter>,
    per_bucket: Option<PerBucketLimiter>,
}

impl LimiterSet {
    #[must_use]
    pub fn new(cfg: &LimiterConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            global: Arc::new(AdaptiveLimiter::new(
                cfg.initial_rate,
                cfg.min_rate,
                cfg.max_rate,
            )),
            per_bucket: cfg.per_bucket.then(|| {
                PerBucketLimiter::new(cfg.initial_rate, cfg.min_rate, cfg.max_rate)
            }),
        }
    }

    /// Admit one request for `bucket`, waiting up to `max_wait`
    pub async fn admit(&self, bucket: &str, max_wait: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        match &self.per_bucket {
            Some(per_bucket) => per_bucket.get(bucket).wait(max_wait).await,
            None => self.global.wait(max_wait).await,
        }
    }

    /// Feed fresh health data into the active limiters
    pub fn update_metrics(&self, error_rate: f64, p99: Duration) {
        if !self.enabled {
            return;
        }
        self.global.update_metrics(error_rate, p99);
        if let Some(per_bucket) = &self.per_bucket {
            per_bucket.update_metrics(error_rate, p99);
        }
    }

    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        self.global.stats()
    }
}
