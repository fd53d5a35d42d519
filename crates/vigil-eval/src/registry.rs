//! Process-wide set of regex patterns that already failed once.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;

/// Patterns that failed during evaluation.
///
/// Grows monotonically. Concurrent inserts of the same pattern are harmless:
/// exactly one caller observes the insertion.
#[derive(Debug, Default)]
pub struct RegexFailureRegistry {
    patterns: DashSet<String>,
    len: AtomicUsize,
}

impl RegexFailureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `pattern` previously failed.
    pub fn contains(&self, pattern: &str) -> bool {
        // Skip the shard lookup while nothing ever failed.
        if self.len.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.patterns.contains(pattern)
    }

    /// Record a failure. Returns `true` if `pattern` was not yet registered.
    pub fn record(&self, pattern: &str, reason: &str) -> bool {
        if !self.patterns.insert(pattern.to_string()) {
            return false;
        }
        self.len.fetch_add(1, Ordering::Release);
        tracing::warn!(pattern, reason, "regex disabled after evaluation failure");
        true
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_registry_contains_nothing() {
        let reg = RegexFailureRegistry::new();
        assert!(reg.is_empty());
        assert!(!reg.contains("a+"));
    }

    #[test]
    fn record_is_idempotent() {
        let reg = RegexFailureRegistry::new();
        assert!(reg.record("a{1000}", "too big"));
        assert!(!reg.record("a{1000}", "too big"));
        assert!(reg.contains("a{1000}"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn concurrent_records_register_once() {
        let reg = Arc::new(RegexFailureRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.record("x", "boom"))
            })
            .collect();
        let first: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(first, 1);
        assert_eq!(reg.len(), 1);
    }
}
