//! Capture counters.
//!
//! Every invocation lands in exactly one bucket, so the counters double as a
//! cheap audit of the skip paths: captured plus all skips equals the number
//! of observed syscall edges.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by all capture handlers.
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    not_instrumented: AtomicU64,
    not_admitted: AtomicU64,
    allow_miss: AtomicU64,
    denied: AtomicU64,
    short_circuited: AtomicU64,
    no_snapshot: AtomicU64,
    dropped_pair: AtomicU64,
    vm_errors: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_instrumented(&self) {
        self.not_instrumented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_admitted(&self) {
        self.not_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allow_miss(&self) {
        self.allow_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn short_circuited(&self) {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_snapshot(&self) {
        self.no_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_pair(&self) {
        self.dropped_pair.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vm_error(&self) {
        self.vm_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            captured: self.captured.load(Ordering::Relaxed),
            not_instrumented: self.not_instrumented.load(Ordering::Relaxed),
            not_admitted: self.not_admitted.load(Ordering::Relaxed),
            allow_miss: self.allow_miss.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            no_snapshot: self.no_snapshot.load(Ordering::Relaxed),
            dropped_pair: self.dropped_pair.load(Ordering::Relaxed),
            vm_errors: self.vm_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub captured: u64,
    pub not_instrumented: u64,
    pub not_admitted: u64,
    pub allow_miss: u64,
    pub denied: u64,
    pub short_circuited: u64,
    pub no_snapshot: u64,
    pub dropped_pair: u64,
    pub vm_errors: u64,
}

impl StatsSummary {
    /// Edges that produced no event.
    pub fn total_skipped(&self) -> u64 {
        self.not_instrumented
            + self.not_admitted
            + self.allow_miss
            + self.denied
            + self.short_circuited
            + self.no_snapshot
            + self.dropped_pair
            + self.vm_errors
    }

    pub fn total_seen(&self) -> u64 {
        self.captured + self.total_skipped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = CaptureStats::new();
        stats.captured();
        stats.captured();
        stats.denied();
        let summary = stats.summary();
        assert_eq!(summary.captured, 2);
        assert_eq!(summary.denied, 1);
        assert_eq!(summary.total_seen(), 3);
    }

    #[test]
    fn test_skipped_excludes_captured() {
        let stats = CaptureStats::new();
        stats.captured();
        stats.allow_miss();
        stats.vm_error();
        let summary = stats.summary();
        assert_eq!(summary.total_skipped(), 2);
    }

    #[test]
    fn test_summary_starts_zeroed() {
        let summary = CaptureStats::new().summary();
        assert_eq!(summary, StatsSummary::default());
        assert_eq!(summary.total_seen(), 0);
    }

    #[test]
    fn test_summary_serializes() {
        let stats = CaptureStats::new();
        stats.short_circuited();
        let json = serde_json::to_value(stats.summary()).unwrap();
        assert_eq!(json["short_circuited"], 1);
    }
}
