//! Process-local counters.
//!
//! Created once at startup and passed explicitly to the components that
//! bump them; nothing reaches these through module-level state.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SchedulerCounters {
    /// Transforms that ran.
    pub transforms_executed: AtomicU64,
    /// Transform triggers dropped because one was already running.
    pub transforms_skipped: AtomicU64,

    /// Outstanding ops that resolved with their expected outcome.
    pub ops_resolved: AtomicU64,
    /// Outstanding ops that failed or timed out.
    pub ops_failed: AtomicU64,
    /// Outstanding ops dropped by the abandon path (unknown outcome).
    pub ops_abandoned: AtomicU64,
}

impl SchedulerCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
