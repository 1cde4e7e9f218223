//! Structured lifecycle events for batches and commits.
//!
//! Every event is an `info!` (or `warn!`/`error!`) with an `event` field,
//! e.g. `event=commit.published`, so log pipelines can filter on it. With
//! `--json` each one is a single JSON line.

use tracing::{error, info, warn};

use crate::domain::CommitId;

/// Span carrying the batch id. Attach with `Instrument::instrument` so it
/// survives `.await` points.
pub fn batch_span(batch_id: &str, size: usize) -> tracing::Span {
    tracing::info_span!("docwright.batch", batch_id = %batch_id, size = size)
}

pub fn emit_batch_started(batch_id: &str, size: usize) {
    info!(event = "batch.started", batch_id = %batch_id, size = size);
}

pub fn emit_batch_finished(batch_id: &str, duration_ms: u64, published: usize, failed: usize) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        duration_ms = duration_ms,
        published = published,
        failed = failed,
    );
}

pub fn emit_commit_published(commit: &CommitId, retried: bool) {
    info!(event = "commit.published", commit = %commit, retried = retried);
}

pub fn emit_commit_failed(commit: &CommitId, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "commit.failed", commit = %commit, stage = stage, error = %error);
}

pub fn emit_environment_recreated(batch_id: &str, reason: &str) {
    info!(event = "environment.recreated", batch_id = %batch_id, reason = reason);
}

pub fn emit_batch_aborted(batch_id: &str, remaining: usize, error: &dyn std::fmt::Display) {
    error!(event = "batch.aborted", batch_id = %batch_id, remaining = remaining, error = %error);
}
