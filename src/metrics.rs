//! `MetricsSnapshot` (§6 Observability): a cheap, lock-free readout of the
//! task queue manager's counters. No export format is implemented — that
//! is a UI/collector concern outside this core.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
    pub queue_depth: u64,
    pub worker_count: u64,
}

#[derive(Default)]
pub struct Metrics {
    pub submitted: AtomicU64,
    pub in_flight: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self, queue_depth: u64, worker_count: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            queue_depth,
            worker_count,
        }
    }
}
