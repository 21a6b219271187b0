//! Gateway metrics
//!
//! Per-operation request and error counters, an inflight gauge whose guard
//! decrements even when a handler unwinds, and a rolling latency window
//! that feeds the adaptive limiter (error rate + p99).

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// S3 operation types served by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S3Operation {
    ListObjects,
    GetObject,
    PutObject,
    DeleteObject,
    HeadObject,
    InitiateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    Other,
}

impl S3Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            S3Operation::ListObjects => "ListObjects",
            S3Operation::GetObject => "GetObject",
            S3Operation::PutObject => "PutObject",
            S3Operation::DeleteObject => "DeleteObject",
            S3Operation::HeadObject => "HeadObject",
            S3Operation::InitiateMultipartUpload => "InitiateMultipartUpload",
            S3Operation::UploadPart => "UploadPart",
            S3Operation::CompleteMultipartUpload => "CompleteMultipartUpload",
            S3Operation::AbortMultipartUpload => "AbortMultipartUpload",
            S3Operation::Other => "Other",
        }
    }
}

#[derive(Debug, Default)]
struct OperationMetrics {
    requests_total: AtomicU64,
    requests_client_error: AtomicU64,
    requests_server_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

/// Rolling sample window for limiter feedback
const WINDOW_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: VecDeque<(u64, bool)>,
}

impl LatencyWindow {
    fn record(&mut self, latency_us: u64, is_error: bool) {
        if self.samples.len() == WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back((latency_us, is_error));
    }

    fn snapshot(&self) -> WindowStats {
        if self.samples.is_empty() {
            return WindowStats::default();
        }
        let errors = self.samples.iter().filter(|(_, e)| *e).count();
        let mut latencies: Vec<u64> = self.samples.iter().map(|(l, _)| *l).collect();
        latencies.sort_unstable();
        let idx = (latencies.len() * 99 / 100).min(latencies.len() - 1);
        WindowStats {
            error_rate: errors as f64 / self.samples.len() as f64,
            p99_us: latencies[idx],
        }
    }
}

/// Recent error rate and p99 latency
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowStats {
    pub error_rate: f64,
    pub p99_us: u64,
}

/// Gateway metrics collector
pub struct S3Metrics {
    operations: RwLock<HashMap<S3Operation, Arc<OperationMetrics>>>,
    /// Error counters keyed `operation:cause`
    errors: RwLock<HashMap<String, Arc<AtomicU64>>>,
    inflight: Arc<AtomicU64>,
    window: Mutex<LatencyWindow>,
    start_time: Instant,
}

impl S3Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            inflight: Arc::new(AtomicU64::new(0)),
            window: Mutex::new(LatencyWindow::default()),
            start_time: Instant::now(),
        }
    }

    /// Record one finished request
    pub fn record_request(&self, op: S3Operation, status: u16, latency_us: u64) {
        let metrics = self.operation(op);
        metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        metrics.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        if (400..500).contains(&status) {
            metrics.requests_client_error.fetch_add(1, Ordering::Relaxed);
        } else if status >= 500 {
            metrics.requests_server_error.fetch_add(1, Ordering::Relaxed);
        }

        self.window.lock().record(latency_us, status >= 500);
    }

    /// Record an error by operation and cause (the S3 error code)
    pub fn record_error(&self, op: S3Operation, cause: &str) {
        let key = format!("{}:{}", op.as_str(), cause);
        let counter = {
            let errors = self.errors.read();
            errors.get(&key).cloned()
        };
        let counter = counter.unwrap_or_else(|| {
            Arc::clone(
                self.errors
                    .write()
                    .entry(key)
                    .or_insert_with(|| Arc::new(AtomicU64::new(0))),
            )
        });
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the inflight gauge; the guard decrements on drop
    #[must_use]
    pub fn inflight_guard(&self) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            gauge: Arc::clone(&self.inflight),
        }
    }

    #[must_use]
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Recent error rate and p99 latency for limiter adaptation
    #[must_use]
    pub fn window_stats(&self) -> WindowStats {
        self.window.lock().snapshot()
    }

    fn operation(&self, op: S3Operation) -> Arc<OperationMetrics> {
        if let Some(metrics) = self.operations.read().get(&op) {
            return Arc::clone(metrics);
        }
        Arc::clone(
            self.operations
                .write()
                .entry(op)
                .or_insert_with(|| Arc::new(OperationMetrics::default())),
        )
    }

    /// Render every counter as `name value` lines for the debug endpoint
    #[must_use]
    pub fn export_text(&self) -> String {
        let mut out = String::with_capacity(2048);
        let _ = writeln!(out, "uptime_seconds {}", self.start_time.elapsed().as_secs());
        let _ = writeln!(out, "requests_in_flight {}", self.inflight());

        let operations = self.operations.read();
        let mut ops: Vec<_> = operations.iter().collect();
        ops.sort_by_key(|(op, _)| op.as_str());
        for (op, m) in ops {
            let name = op.as_str();
            let _ = writeln!(
                out,
                "requests_total{{op=\"{name}\"}} {}",
                m.requests_total.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "requests_client_error{{op=\"{name}\"}} {}",
                m.requests_client_error.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "requests_server_error{{op=\"{name}\"}} {}",
                m.requests_server_error.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "request_latency_us_sum{{op=\"{name}\"}} {}",
                m.latency_sum_us.load(Ordering::Relaxed)
            );
        }
        drop(operations);

        let errors = self.errors.read();
        let mut errs: Vec<_> = errors.iter().collect();
        errs.sort_by_key(|(k, _)| k.as_str());
        for (key, counter) in errs {
            let _ = writeln!(
                out,
                "errors_total{{key=\"{key}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }

        out
    }
}

impl Default for S3Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the inflight gauge when dropped, even on unwinds
pub struct InflightGuard {
    gauge: Arc<AtomicU64>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        let metrics = S3Metrics::new();
        metrics.record_request(S3Operation::GetObject, 200, 1500);
        metrics.record_request(S3Operation::GetObject, 404, 300);
        metrics.record_request(S3Operation::PutObject, 500, 9000);
        metrics.record_error(S3Operation::PutObject, "InternalError");

        let text = metrics.export_text();
        assert!(text.contains("requests_total{op=\"GetObject\"} 2"));
        assert!(text.contains("requests_client_error{op=\"GetObject\"} 1"));
        assert!(text.contains("requests_server_error{op=\"PutObject\"} 1"));
        assert!(text.contains("errors_total{key=\"PutObject:InternalError\"} 1"));
    }

    #[test]
    fn test_inflight_guard_decrements_on_drop() {
        let metrics = S3Metrics::new();
        {
            let _a = metrics.inflight_guard();
            let _b = metrics.inflight_guard();
            assert_eq!(metrics.inflight(), 2);
        }
        assert_eq!(metrics.inflight(), 0);
    }

    #[test]
    fn test_window_stats() {
        let metrics = S3Metrics::new();
        for _ in 0..99 {
            metrics.record_request(S3Operation::GetObject, 200, 1000);
        }
        metrics.record_request(S3Operation::GetObject, 500, 50_000);

        let stats = metrics.window_stats();
        assert!((stats.error_rate - 0.01).abs() < 1e-9);
        assert_eq!(stats.p99_us, 50_000);
    }
}
