//! Background build queue.
//!
//! `submit` hands a batch to a bounded queue and returns at once, so an
//! intake path (webhook, stdin reader) never waits on a build. One worker
//! drains the queue, running each batch in its own task: a panic there is
//! caught, logged and reported through the hook as an aborted batch, and
//! the worker moves on to the next batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::{CommitBatch, CommitId};
use crate::hook::BatchAbortReport;
use crate::orchestrator::BuildOrchestrator;

/// Default number of batches that may wait in the queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("build queue is full ({capacity} batches waiting)")]
    QueueFull { capacity: usize },

    #[error("build service has shut down")]
    Closed,
}

/// Handle to the background worker.
pub struct BuildService {
    tx: mpsc::Sender<(String, CommitBatch)>,
    worker: JoinHandle<()>,
    capacity: usize,
    completed: Arc<AtomicUsize>,
}

impl BuildService {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(orchestrator: Arc<BuildOrchestrator>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let completed = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(work(orchestrator, rx, Arc::clone(&completed)));
        BuildService {
            tx,
            worker,
            capacity,
            completed,
        }
    }

    /// Queue a batch. Returns its batch id without waiting for the build.
    pub fn submit(&self, batch: CommitBatch) -> Result<String, SubmitError> {
        let batch_id = Uuid::new_v4().to_string();
        let size = batch.len();
        self.tx
            .try_send((batch_id.clone(), batch))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })?;
        info!(batch_id = %batch_id, size, "batch queued");
        Ok(batch_id)
    }

    /// Batches finished so far, including aborted and panicked ones.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stop accepting batches, finish everything queued, then return the
    /// total number of batches handled.
    pub async fn shutdown(self) -> usize {
        let BuildService {
            tx,
            worker,
            completed,
            ..
        } = self;
        drop(tx);
        if let Err(e) = worker.await {
            error!(error = %e, "build worker ended abnormally");
        }
        completed.load(Ordering::SeqCst)
    }
}

async fn work(
    orchestrator: Arc<BuildOrchestrator>,
    mut rx: mpsc::Receiver<(String, CommitBatch)>,
    completed: Arc<AtomicUsize>,
) {
    while let Some((batch_id, batch)) = rx.recv().await {
        let ids: Vec<CommitId> = batch.commits().iter().map(|c| c.id.clone()).collect();
        let runner = Arc::clone(&orchestrator);
        let id = batch_id.clone();
        let task = tokio::spawn(async move { runner.run_batch_as(id, batch).await });

        match task.await {
            Ok(summary) => {
                info!(
                    batch_id = %batch_id,
                    state = ?summary.state,
                    published = summary.published().len(),
                    failed = summary.failed().len(),
                    "batch complete"
                );
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    "batch task panicked".to_string()
                } else {
                    format!("batch task cancelled: {e}")
                };
                error!(batch_id = %batch_id, reason = %reason, "batch did not finish");
                let report = BatchAbortReport {
                    batch_id: batch_id.clone(),
                    reason,
                    remaining: ids,
                };
                orchestrator.hook().batch_aborted(&report).await;
            }
        }
        completed.fetch_add(1, Ordering::SeqCst);
    }
    info!("build queue closed; worker exiting");
}
