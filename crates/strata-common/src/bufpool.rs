//! Reusable byte buffers for streaming paths
//!
//! Scratch buffers come in four size classes (4 KiB, 64 KiB, 1 MiB, 16 MiB);
//! requests larger than the biggest class are allocated directly and never
//! pooled.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const SMALL_BUFFER_SIZE: usize = 4 * 1024;
pub const MEDIUM_BUFFER_SIZE: usize = 64 * 1024;
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;
pub const HUGE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Per-class free list capped at a fixed number of retained buffers
struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl SizeClass {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    fn get(&self) -> Vec<u8> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    fn put(&self, mut buf: Vec<u8>) {
        const MAX_RETAINED: usize = 32;
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < MAX_RETAINED {
            buf.clear();
            buf.resize(self.size, 0);
            free.push(buf);
        }
    }
}

/// Pool of reusable scratch buffers with size classes
pub struct BufferPool {
    small: SizeClass,
    medium: SizeClass,
    large: SizeClass,
    huge: SizeClass,
}

/// Snapshot of pool activity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub gets: u64,
    pub puts: u64,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            small: SizeClass::new(SMALL_BUFFER_SIZE),
            medium: SizeClass::new(MEDIUM_BUFFER_SIZE),
            large: SizeClass::new(LARGE_BUFFER_SIZE),
            huge: SizeClass::new(HUGE_BUFFER_SIZE),
        }
    }

    /// Get a buffer of at least `size` bytes, truncated to `size`
    #[must_use]
    pub fn get(&self, size: usize) -> Vec<u8> {
        let mut buf = match size {
            s if s <= SMALL_BUFFER_SIZE => self.small.get(),
            s if s <= MEDIUM_BUFFER_SIZE => self.medium.get(),
            s if s <= LARGE_BUFFER_SIZE => self.large.get(),
            s if s <= HUGE_BUFFER_SIZE => self.huge.get(),
            s => return vec![0u8; s],
        };
        buf.truncate(size);
        buf
    }

    /// Return a buffer to its size class; odd-sized buffers are dropped
    pub fn put(&self, buf: Vec<u8>) {
        match buf.capacity() {
            c if c == SMALL_BUFFER_SIZE => self.small.put(buf),
            c if c == MEDIUM_BUFFER_SIZE => self.medium.put(buf),
            c if c == LARGE_BUFFER_SIZE => self.large.put(buf),
            c if c == HUGE_BUFFER_SIZE => self.huge.put(buf),
            _ => {}
        }
    }

    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let gets = self.small.gets.load(Ordering::Relaxed)
            + self.medium.gets.load(Ordering::Relaxed)
            + self.large.gets.load(Ordering::Relaxed)
            + self.huge.gets.load(Ordering::Relaxed);
        let puts = self.small.puts.load(Ordering::Relaxed)
            + self.medium.puts.load(Ordering::Relaxed)
            + self.large.puts.load(Ordering::Relaxed)
            + self.huge.puts.load(Ordering::Relaxed);
        BufferPoolStats { gets, puts }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_sizes() {
        let pool = BufferPool::new();
        assert_eq!(pool.get(100).len(), 100);
        assert_eq!(pool.get(SMALL_BUFFER_SIZE).capacity(), SMALL_BUFFER_SIZE);
        assert_eq!(pool.get(SMALL_BUFFER_SIZE + 1).capacity(), MEDIUM_BUFFER_SIZE);
        // Oversized requests bypass the pool
        let big = pool.get(HUGE_BUFFER_SIZE + 1);
        assert_eq!(big.len(), HUGE_BUFFER_SIZE + 1);
    }

    #[test]
    fn test_recycling() {
        let pool = BufferPool::new();
        let buf = pool.get(MEDIUM_BUFFER_SIZE);
        pool.put(buf);
        let again = pool.get(MEDIUM_BUFFER_SIZE);
        assert_eq!(again.len(), MEDIUM_BUFFER_SIZE);
        let stats = pool.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.puts, 1);
    }
}
