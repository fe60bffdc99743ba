//! Per-server failure accounting.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// A server may fail this many times before routing skips it
const MAX_FAILURES_BEFORE_SKIP: u32 = 1;

/// Lock-free per-URL failure counters.
///
/// Counters only grow on failure and are reset to zero on any successful
/// call. There is no eviction: the key set is bounded by cluster size.
#[derive(Debug, Default)]
pub struct FailureCounters {
    counters: DashMap<String, AtomicU32>,
}

impl FailureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current failure count for a URL (zero when never seen)
    pub fn get(&self, url: &str) -> u32 {
        self.counters
            .get(url)
            .map(|entry| entry.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a failure, returning the new count
    pub fn increment(&self, url: &str) -> u32 {
        self.counters
            .entry(url.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Record a success
    pub fn reset(&self, url: &str) {
        if let Some(entry) = self.counters.get(url) {
            entry.store(0, Ordering::Relaxed);
        }
    }

    /// Whether routing should still try this server
    pub fn is_eligible(&self, url: &str) -> bool {
        self.get(url) <= MAX_FAILURES_BEFORE_SKIP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_url_is_healthy() {
        let counters = FailureCounters::new();
        assert_eq!(counters.get("http://a"), 0);
        assert!(counters.is_eligible("http://a"));
    }

    #[test]
    fn test_one_failure_is_tolerated() {
        let counters = FailureCounters::new();
        assert_eq!(counters.increment("http://a"), 1);
        assert!(counters.is_eligible("http://a"));

        assert_eq!(counters.increment("http://a"), 2);
        assert!(!counters.is_eligible("http://a"));
    }

    #[test]
    fn test_reset_restores_eligibility() {
        let counters = FailureCounters::new();
        counters.increment("http://a");
        counters.increment("http://a");
        assert!(!counters.is_eligible("http://a"));

        counters.reset("http://a");
        assert_eq!(counters.get("http://a"), 0);
        assert!(counters.is_eligible("http://a"));
    }

    #[test]
    fn test_counters_are_per_url() {
        let counters = FailureCounters::new();
        counters.increment("http://a");
        assert_eq!(counters.get("http://a"), 1);
        assert_eq!(counters.get("http://b"), 0);
    }
}
