//! Anti-entropy repair accounting
//!
//! The repair loops themselves live on the coordinators
//! ([`crate::Replicated::repair_pass`], [`crate::EcCluster::repair_pass`]);
//! this module holds the shared counters surfaced through the gateway's
//! debug endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the background repair loop
#[derive(Debug, Default)]
pub struct RepairStats {
    scans: AtomicU64,
    fixed: AtomicU64,
    failed: AtomicU64,
}

impl RepairStats {
    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fixed(&self) {
        self.fixed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fixed(&self) -> u64 {
        self.fixed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RepairStats::default();
        stats.record_scan();
        stats.record_fixed();
        stats.record_fixed();
        stats.record_failed();
        assert_eq!(stats.scans(), 1);
        assert_eq!(stats.fixed(), 2);
        assert_eq!(stats.failed(), 1);
    }
}
