//! Global atomic counters for the build pipeline.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so after every batch).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    batches_processed: AtomicU64,
    commits_published: AtomicU64,
    commits_failed: AtomicU64,
    environment_recreations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            batches_processed: AtomicU64::new(0),
            commits_published: AtomicU64::new(0),
            commits_failed: AtomicU64::new(0),
            environment_recreations: AtomicU64::new(0),
        }
    }

    pub fn inc_batches(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "batches_processed", "counter incremented");
    }

    pub fn inc_published(&self) {
        self.commits_published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits_published", "counter incremented");
    }

    pub fn inc_failed(&self) {
        self.commits_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits_failed", "counter incremented");
    }

    pub fn inc_recreations(&self) {
        self.environment_recreations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "environment_recreations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            batches_processed = self.batches_processed(),
            commits_published = self.commits_published(),
            commits_failed = self.commits_failed(),
            environment_recreations = self.environment_recreations(),
        );
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    pub fn commits_published(&self) -> u64 {
        self.commits_published.load(Ordering::Relaxed)
    }

    pub fn commits_failed(&self) -> u64 {
        self.commits_failed.load(Ordering::Relaxed)
    }

    pub fn environment_recreations(&self) -> u64 {
        self.environment_recreations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.batches_processed.store(0, Ordering::Relaxed);
        self.commits_published.store(0, Ordering::Relaxed);
        self.commits_failed.store(0, Ordering::Relaxed);
        self.environment_recreations.store(0, Ordering::Relaxed);
    }
}
