//! Journal counters and the outstanding-I/O instrumentation seam
//!
//! - Counters are monotonic except the outstanding-AIO gauge
//! - Thread-safe and lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Receiver of outstanding asynchronous operation counts.
///
/// Optional collaborator of the journal; a journal built without one uses
/// [`NoopInstrumentation`].
pub trait InstrumentationSink: Send + Sync {
    fn incr_outstanding_aio(&self);
    fn decr_outstanding_aio(&self);
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl InstrumentationSink for NoopInstrumentation {
    fn incr_outstanding_aio(&self) {}
    fn decr_outstanding_aio(&self) {}
}

/// Operational counters of one journal.
///
/// Uses Relaxed ordering; values are exact once the journal is quiescent.
#[derive(Debug, Default)]
pub struct JournalMetrics {
    enqueues: AtomicU64,
    dequeues: AtomicU64,
    txn_commits: AtomicU64,
    txn_aborts: AtomicU64,
    txn_prepares: AtomicU64,
    pages_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    busy_rejections: AtomicU64,
    flushes: AtomicU64,
    extents_acquired: AtomicU64,
    extents_released: AtomicU64,
    outstanding_aio: AtomicU64,
}

impl JournalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_enqueues(&self) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dequeues(&self) {
        self.dequeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_txn_commits(&self) {
        self.txn_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_txn_aborts(&self) {
        self.txn_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_txn_prepares(&self) {
        self.txn_prepares.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one completed page write of `bytes` bytes.
    pub fn add_page_written(&self, bytes: u64) {
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_write_failures(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_busy_rejections(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_extents_acquired(&self) {
        self.extents_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_extents_released(&self) {
        self.extents_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outstanding_aio(&self) -> u64 {
        self.outstanding_aio.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            dequeues: self.dequeues.load(Ordering::Relaxed),
            txn_commits: self.txn_commits.load(Ordering::Relaxed),
            txn_aborts: self.txn_aborts.load(Ordering::Relaxed),
            txn_prepares: self.txn_prepares.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            extents_acquired: self.extents_acquired.load(Ordering::Relaxed),
            extents_released: self.extents_released.load(Ordering::Relaxed),
            outstanding_aio: self.outstanding_aio.load(Ordering::Relaxed),
        }
    }
}

impl InstrumentationSink for JournalMetrics {
    fn incr_outstanding_aio(&self) {
        self.outstanding_aio.fetch_add(1, Ordering::Relaxed);
    }

    fn decr_outstanding_aio(&self) {
        // Saturating: a stray decrement must not wrap the gauge.
        let _ = self
            .outstanding_aio
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueues: u64,
    pub dequeues: u64,
    pub txn_commits: u64,
    pub txn_aborts: u64,
    pub txn_prepares: u64,
    pub pages_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub busy_rejections: u64,
    pub flushes: u64,
    pub extents_acquired: u64,
    pub extents_released: u64,
    pub outstanding_aio: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_metrics_are_zero() {
        let snapshot = JournalMetrics::new().snapshot();
        assert_eq!(snapshot.enqueues, 0);
        assert_eq!(snapshot.pages_written, 0);
        assert_eq!(snapshot.outstanding_aio, 0);
    }

    #[test]
    fn test_page_written_accumulates_bytes() {
        let metrics = JournalMetrics::new();
        metrics.add_page_written(4096);
        metrics.add_page_written(512);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_written, 2);
        assert_eq!(snapshot.bytes_written, 4608);
    }

    #[test]
    fn test_outstanding_gauge_never_wraps() {
        let metrics = JournalMetrics::new();
        metrics.incr_outstanding_aio();
        metrics.decr_outstanding_aio();
        metrics.decr_outstanding_aio();
        assert_eq!(metrics.outstanding_aio(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = JournalMetrics::new();
        metrics.increment_enqueues();
        metrics.increment_txn_prepares();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["enqueues"], 1);
        assert_eq!(json["txn_prepares"], 1);
    }

    #[test]
    fn test_noop_sink_through_trait_object() {
        let sink: Arc<dyn InstrumentationSink> = Arc::new(NoopInstrumentation);
        sink.incr_outstanding_aio();
        sink.decr_outstanding_aio();
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(JournalMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.increment_enqueues();
                        metrics.incr_outstanding_aio();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.enqueues, 800);
        assert_eq!(snapshot.outstanding_aio, 800);
    }
}
