//! Single-flight request coalescing
//!
//! At most one fetch runs per key; concurrent callers with the same key
//! wait on the leader and share its result, success or failure. The key is
//! removed from the in-flight table before waiters resume, so the next
//! caller after completion starts a fresh fetch.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{Error, Result};
use tokio::sync::broadcast;

/// Coalescer statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub coalesced_requests: u64,
    /// Backend calls avoided; equals the number of waiters served
    pub saved_requests: u64,
}

/// Single-flight deduplication keyed by an operation fingerprint
pub struct Coalescer<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<T>>>>,
    total: AtomicU64,
    coalesced: AtomicU64,
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `make` once per key; concurrent callers share the result
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total.fetch_add(1, Ordering::Relaxed);

        let waiter = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return match rx.recv().await {
                Ok(result) => result,
                // The leader was cancelled before publishing a result
                Err(_) => Err(Error::internal("coalesced request abandoned")),
            };
        }

        // Leader: if this future is dropped mid-fetch, the guard removes
        // the key and the closed channel wakes every waiter.
        let guard = LeaderGuard {
            inflight: &self.inflight,
            key,
        };
        let result = make().await;

        let tx = self.inflight.lock().remove(key);
        std::mem::forget(guard);
        if let Some(tx) = tx {
            let _ = tx.send(result.clone());
        }
        result
    }

    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        let coalesced = self.coalesced.load(Ordering::Relaxed);
        CoalescerStats {
            total_requests: self.total.load(Ordering::Relaxed),
            coalesced_requests: coalesced,
            saved_requests: coalesced,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct LeaderGuard<'a, T: Clone> {
    inflight: &'a Mutex<HashMap<String, broadcast::Sender<Result<T>>>>,
    key: &'a str,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(self.key);
    }
}
