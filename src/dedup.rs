//! Idempotency set: time-windowed duplicate rejection
//!
//! Tracks identity keys within a seen-window. A key already present
//! causes later submissions with the same key to be rejected, not
//! re-queued.
//!
//! # Memory Behavior
//!
//! The `seen` HashMap grows as new unique keys arrive. Expired entries
//! are only removed every `cleanup_interval` operations, so memory may
//! grow between cleanups. A hard `max_entries` bound caps the worst
//! case: when exceeded the set is flushed wholesale, trading a burst of
//! re-accepted duplicates for bounded memory.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_CLEANUP_INTERVAL: u32 = 1000;
const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Bounded set of recently-seen identity keys
pub struct IdempotencySet {
    /// key -> first seen time
    seen: Mutex<HashMap<String, Instant>>,
    /// Seen-window: how long a key is remembered
    window: Duration,
    /// Hard size bound; set is flushed when exceeded
    max_entries: usize,
    /// Counter for cleanup scheduling (atomic to avoid a second mutex)
    ops_since_cleanup: AtomicU32,
    /// Cleanup every N operations (minimum 1)
    cleanup_interval: u32,
}

impl IdempotencySet {
    /// Create a set with the given seen-window
    ///
    /// Uses default cleanup interval (1000 ops) and size bound (100k keys).
    pub fn new(window: Duration) -> Self {
        Self::with_bounds(window, DEFAULT_MAX_ENTRIES, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Create a set with explicit size bound and cleanup interval
    ///
    /// Lower `cleanup_interval` = more frequent cleanup = lower memory,
    /// higher overhead.
    pub fn with_bounds(window: Duration, max_entries: usize, cleanup_interval: u32) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
            max_entries: max_entries.max(1),
            ops_since_cleanup: AtomicU32::new(0),
            cleanup_interval: cleanup_interval.max(1),
        }
    }

    /// Mark a key seen, returning whether it was new
    ///
    /// Returns `true` if the key was not present (or had expired) and is
    /// now recorded. Returns `false` for a duplicate within the window.
    pub fn mark_seen(&self, key: &str) -> bool {
        let now = Instant::now();

        // Multiple threads may trigger cleanup concurrently; that is
        // safe, just slightly inefficient.
        let ops = self.ops_since_cleanup.fetch_add(1, Ordering::Relaxed);
        if ops >= self.cleanup_interval {
            self.ops_since_cleanup.store(0, Ordering::Relaxed);
            self.cleanup(now);
        }

        let mut seen = self.seen.lock();

        if let Some(first_seen) = seen.get(key) {
            if now.duration_since(*first_seen) < self.window {
                return false;
            }
        }

        if seen.len() >= self.max_entries {
            // Size bound reached even after TTL cleanup: flush wholesale
            tracing::warn!(
                entries = seen.len(),
                "idempotency set over capacity, flushing"
            );
            seen.clear();
        }

        seen.insert(key.to_string(), now);
        true
    }

    /// Check whether a key is currently within the seen-window
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let seen = self.seen.lock();
        match seen.get(key) {
            Some(first_seen) => now.duration_since(*first_seen) < self.window,
            None => false,
        }
    }

    /// Remove expired entries
    fn cleanup(&self, now: Instant) {
        let mut seen = self.seen.lock();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
    }

    /// Forget a single key, making it immediately admissible again
    ///
    /// Used when an item is marked seen but then dropped before it is
    /// enqueued; the key must not stay burned for the whole window.
    pub fn forget(&self, key: &str) {
        self.seen.lock().remove(key);
    }

    /// Drop all tracked keys (explicit cache clear)
    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    /// Current number of tracked keys (snapshot)
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether the set is currently empty (snapshot)
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_key_is_new() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        assert!(set.mark_seen("key-1"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        assert!(set.mark_seen("key-1"));
        assert!(!set.mark_seen("key-1"));
        assert!(set.mark_seen("key-2"));
        assert!(!set.mark_seen("key-2"));
    }

    #[test]
    fn test_contains() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        assert!(!set.contains("key-1"));
        set.mark_seen("key-1");
        assert!(set.contains("key-1"));
    }

    #[test]
    fn test_expired_key_accepted_again() {
        let set = IdempotencySet::new(Duration::from_millis(10));
        assert!(set.mark_seen("expire-test"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(set.mark_seen("expire-test"));
    }

    #[test]
    fn test_forget_readmits_one_key() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        set.mark_seen("keep");
        set.mark_seen("drop");
        set.forget("drop");
        assert!(!set.mark_seen("keep"));
        assert!(set.mark_seen("drop"));
    }

    #[test]
    fn test_clear() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        set.mark_seen("key-1");
        assert_eq!(set.len(), 1);
        set.clear();
        assert!(set.is_empty());
        assert!(set.mark_seen("key-1"));
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let set = IdempotencySet::with_bounds(Duration::from_millis(5), 100_000, 10);

        for i in 0..5 {
            set.mark_seen(&format!("key-{}", i));
        }
        assert_eq!(set.len(), 5);

        std::thread::sleep(Duration::from_millis(10));

        // Trigger cleanup by inserting more keys (interval is 10)
        for i in 5..20 {
            set.mark_seen(&format!("key-{}", i));
        }

        assert!(
            set.len() < 20,
            "expected cleanup to reduce entries, got {}",
            set.len()
        );
    }

    #[test]
    fn test_size_bound_flushes() {
        let set = IdempotencySet::with_bounds(Duration::from_secs(600), 5, 1000);

        for i in 0..5 {
            set.mark_seen(&format!("key-{}", i));
        }
        assert_eq!(set.len(), 5);

        // Sixth insert exceeds the bound, flushing the set
        assert!(set.mark_seen("key-5"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_concurrent_same_key() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(IdempotencySet::new(Duration::from_secs(60)));
        let mut handles = vec![];

        for _ in 0..10 {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || set.mark_seen("same-key")));
        }

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let passed = results.iter().filter(|&&r| r).count();
        assert_eq!(passed, 1, "expected exactly 1 new, got {}", passed);
    }
}
