//! Build orchestrator: drives one commit batch from intake to publication.
//!
//! Fetches run concurrently (bounded by `fetch.concurrency`) but are
//! consumed strictly in batch order. Builds are sequential against the one
//! cached environment. A failed build is retried once after the environment
//! has been rebuilt, and only the first failure of a batch gets that
//! treatment. The head pointer only ever moves forward onto a freshly
//! published commit.
//!
//! One batch at a time owns the environment and head pointer; concurrent
//! callers of [`BuildOrchestrator::run_batch`] queue on an internal lock.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use env_provisioner::{CommandProvisioner, EnvError, Environment, EnvironmentProvisioner};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::context::Context;
use crate::domain::{Commit, CommitBatch, CommitId, Credential, DocwrightError};
use crate::executor::{BuildExecutor, CommandExecutor};
use crate::fetch::{FetchResult, FetchedSnapshot, HttpSnapshotFetcher, SnapshotFetcher};
use crate::hook::{BatchAbortReport, CommitOutcome, CommitReport, CompletionHook, HttpHook, LogHook};
use crate::metrics::METRICS;
use crate::obs;
use crate::snapshot::{extract_snapshot, ExtractedSnapshot};
use crate::store::ArtifactStore;

/// Where a commit is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Fetching,
    Extracted,
    Building,
    Published,
    Failed,
}

impl CommitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommitState::Published | CommitState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Done,
    /// Stopped early because no environment could be obtained.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitProgress {
    pub commit_id: CommitId,
    pub state: CommitState,
}

/// Everything that happened in one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub state: BatchState,
    pub commits: Vec<CommitProgress>,
    pub reports: Vec<CommitReport>,
    pub aborted: Option<BatchAbortReport>,
    /// Head pointer after the batch.
    pub head: Option<CommitId>,
    pub environment_recreated: bool,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn published(&self) -> Vec<&CommitId> {
        self.ids_in(CommitState::Published)
    }

    pub fn failed(&self) -> Vec<&CommitId> {
        self.ids_in(CommitState::Failed)
    }

    fn ids_in(&self, state: CommitState) -> Vec<&CommitId> {
        self.commits
            .iter()
            .filter(|c| c.state == state)
            .map(|c| &c.commit_id)
            .collect()
    }
}

/// Per-batch mutable bookkeeping.
struct BatchRun {
    batch_id: String,
    commits: Vec<Commit>,
    states: Vec<CommitState>,
    reports: Vec<CommitReport>,
    aborted: Option<BatchAbortReport>,
    recreated: bool,
}

impl BatchRun {
    fn transition(&mut self, index: usize, state: CommitState) {
        debug!(
            commit = %self.commits[index].id.short(),
            from = ?self.states[index],
            to = ?state,
            "commit state"
        );
        self.states[index] = state;
    }

    /// Commits that never reached a terminal state.
    fn unfinished(&self) -> Vec<CommitId> {
        self.commits
            .iter()
            .zip(&self.states)
            .filter(|(_, s)| !s.is_terminal())
            .map(|(c, _)| c.id.clone())
            .collect()
    }
}

/// Ties fetcher, provisioner, executor, store and hook together.
pub struct BuildOrchestrator {
    context: Arc<Context>,
    fetcher: Arc<dyn SnapshotFetcher>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    executor: Arc<dyn BuildExecutor>,
    hook: Arc<dyn CompletionHook>,
    store: ArtifactStore,
    batch_lock: Mutex<()>,
}

impl BuildOrchestrator {
    pub fn new(
        context: Arc<Context>,
        fetcher: Arc<dyn SnapshotFetcher>,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        executor: Arc<dyn BuildExecutor>,
        hook: Arc<dyn CompletionHook>,
    ) -> Self {
        let store = ArtifactStore::new(&context.config().save_directory);
        BuildOrchestrator {
            context,
            fetcher,
            provisioner,
            executor,
            hook,
            store,
            batch_lock: Mutex::new(()),
        }
    }

    /// Production wiring: HTTP fetcher, command provisioner and executor,
    /// HTTP hook if `complete_hook_url` is set (log hook otherwise).
    pub fn from_context(context: Arc<Context>) -> Result<Self, DocwrightError> {
        let config = context.config();
        let fetcher = HttpSnapshotFetcher::from_config(config)
            .map_err(|e| DocwrightError::Config(format!("cannot build HTTP client: {e}")))?;
        let provisioner = CommandProvisioner::new(config.provisioner_config());
        let executor = CommandExecutor::new(config.build.clone());
        let hook: Arc<dyn CompletionHook> = match &config.complete_hook_url {
            Some(url) => Arc::new(
                HttpHook::new(url.clone())
                    .map_err(|e| DocwrightError::Config(format!("cannot build hook client: {e}")))?,
            ),
            None => Arc::new(LogHook),
        };

        Ok(Self::new(
            context,
            Arc::new(fetcher),
            Arc::new(provisioner),
            Arc::new(executor),
            hook,
        ))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn hook(&self) -> &Arc<dyn CompletionHook> {
        &self.hook
    }

    /// Process one batch to completion. Per-commit failures end up in the
    /// summary and the hook; nothing here returns an error.
    pub async fn run_batch(&self, batch: CommitBatch) -> BatchSummary {
        self.run_batch_as(Uuid::new_v4().to_string(), batch).await
    }

    /// [`run_batch`](Self::run_batch) under a caller-chosen batch id.
    pub async fn run_batch_as(&self, batch_id: String, batch: CommitBatch) -> BatchSummary {
        let span = obs::batch_span(&batch_id, batch.len());
        self.run_batch_inner(batch_id, batch).instrument(span).await
    }

    async fn run_batch_inner(&self, batch_id: String, batch: CommitBatch) -> BatchSummary {
        let _guard = self.batch_lock.lock().await;
        let started = Instant::now();
        let (commits, batch_credential) = batch.into_parts();
        // Resolved once; a refresh during the batch does not affect it.
        let credential = batch_credential.or_else(|| self.context.credential());

        obs::emit_batch_started(&batch_id, commits.len());
        METRICS.inc_batches();

        let mut run = BatchRun {
            batch_id,
            states: vec![CommitState::Pending; commits.len()],
            commits,
            reports: Vec::new(),
            aborted: None,
            recreated: false,
        };

        let state = if run.commits.is_empty() {
            BatchState::Done
        } else {
            self.drive(&mut run, credential).await
        };

        let head = self.store.head().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read head pointer");
            None
        });
        let duration_ms = started.elapsed().as_millis() as u64;
        let published = run.states.iter().filter(|s| **s == CommitState::Published).count();
        let failed = run.states.iter().filter(|s| **s == CommitState::Failed).count();
        obs::emit_batch_finished(&run.batch_id, duration_ms, published, failed);
        METRICS.flush();

        BatchSummary {
            commits: run
                .commits
                .iter()
                .zip(&run.states)
                .map(|(c, s)| CommitProgress {
                    commit_id: c.id.clone(),
                    state: *s,
                })
                .collect(),
            batch_id: run.batch_id,
            state,
            reports: run.reports,
            aborted: run.aborted,
            head,
            environment_recreated: run.recreated,
            duration_ms,
        }
    }

    async fn drive(&self, run: &mut BatchRun, credential: Option<Credential>) -> BatchState {
        let work_dir = self.context.config().work_dir();
        let download_dir = work_dir.join(format!("fetch-{}", run.batch_id));
        let mut fetches = self.spawn_fetches(run, credential, &download_dir);

        let state = self.build_in_order(run, &mut fetches, &work_dir).await;

        for handle in &fetches {
            handle.abort();
        }
        if let Err(e) = tokio::fs::remove_dir_all(&download_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %download_dir.display(),
                    error = %e,
                    "failed to remove download directory"
                );
            }
        }
        state
    }

    fn spawn_fetches(
        &self,
        run: &mut BatchRun,
        credential: Option<Credential>,
        download_dir: &Path,
    ) -> Vec<JoinHandle<FetchResult<FetchedSnapshot>>> {
        let sem = Arc::new(Semaphore::new(self.context.config().fetch.concurrency));
        let mut handles = Vec::with_capacity(run.commits.len());

        for index in 0..run.commits.len() {
            run.transition(index, CommitState::Fetching);
            let commit = run.commits[index].id.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let credential = credential.clone();
            let dest = download_dir.to_path_buf();
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    fetcher.fetch(&commit, credential.as_ref(), &dest).await
                }
                .in_current_span(),
            );
            handles.push(task);
        }
        handles
    }

    async fn build_in_order(
        &self,
        run: &mut BatchRun,
        fetches: &mut [JoinHandle<FetchResult<FetchedSnapshot>>],
        work_dir: &Path,
    ) -> BatchState {
        let forced = self.context.config().recreate_environment;
        let mut env = match self.provisioner.ensure(forced).await {
            Ok(env) => env,
            Err(e) => {
                self.abort(run, &e).await;
                return BatchState::Aborted;
            }
        };
        if forced {
            run.recreated = true;
            METRICS.inc_recreations();
            obs::emit_environment_recreated(&run.batch_id, "forced");
        }

        for (index, handle) in fetches.iter_mut().enumerate() {
            let snapshot = match handle.await {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(e)) => {
                    self.fail(run, index, "fetch", fetch_failed(&e)).await;
                    continue;
                }
                Err(e) => {
                    self.fail(run, index, "fetch", fetch_failed(&e)).await;
                    continue;
                }
            };

            let extracted = match extract_snapshot(&snapshot, work_dir).await {
                Ok(extracted) => extracted,
                Err(e) => {
                    let outcome = fetch_failed(&format!("cannot extract archive: {e}"));
                    self.fail(run, index, "extract", outcome).await;
                    continue;
                }
            };
            run.transition(index, CommitState::Extracted);

            if let Err(reason) = self.build_commit(run, index, &extracted, &mut env).await {
                discard(&extracted).await;
                self.abort(run, &reason).await;
                return BatchState::Aborted;
            }
        }
        BatchState::Done
    }

    /// Build, maybe retry, then publish or report. `Err` only when a
    /// replacement environment could not be constructed.
    async fn build_commit(
        &self,
        run: &mut BatchRun,
        index: usize,
        extracted: &ExtractedSnapshot,
        env: &mut Environment,
    ) -> Result<(), EnvError> {
        run.transition(index, CommitState::Building);
        let id = run.commits[index].id.clone();
        let mut retried = false;

        let mut result = self.executor.build(&extracted.source_root, env).await;
        if let Err(failure) = &result {
            if run.recreated {
                info!(commit = %id.short(), "environment already recreated; not retrying");
            } else {
                warn!(
                    commit = %id.short(),
                    error = %failure,
                    "build failed; recreating environment"
                );
                *env = self.provisioner.ensure(true).await?;
                run.recreated = true;
                retried = true;
                METRICS.inc_recreations();
                obs::emit_environment_recreated(&run.batch_id, "build_failure");
                result = self.executor.build(&extracted.source_root, env).await;
            }
        }

        let staged = match result {
            Ok(staged) => staged,
            Err(failure) => {
                let outcome = CommitOutcome::BuildFailed {
                    error: failure.detail(),
                    retried,
                };
                self.fail(run, index, "build", outcome).await;
                discard(extracted).await;
                return Ok(());
            }
        };

        match self.store.publish(&id, &staged.output_dir) {
            Ok(path) => {
                if let Err(e) = self.store.set_head(&id) {
                    error!(
                        commit = %id.short(),
                        error = %e,
                        "published but head pointer not updated"
                    );
                }
                discard(extracted).await;
                run.transition(index, CommitState::Published);
                METRICS.inc_published();
                obs::emit_commit_published(&id, retried);
                self.report(run, index, CommitOutcome::Published { path }).await;
            }
            Err(e) => {
                // The staged output stays put for manual recovery.
                let outcome = CommitOutcome::PublishFailed {
                    error: e.to_string(),
                    staging_dir: staged.output_dir.clone(),
                };
                self.fail(run, index, "publish", outcome).await;
            }
        }
        Ok(())
    }

    async fn fail(&self, run: &mut BatchRun, index: usize, stage: &str, outcome: CommitOutcome) {
        run.transition(index, CommitState::Failed);
        METRICS.inc_failed();
        let error = outcome.error().unwrap_or_default();
        obs::emit_commit_failed(&run.commits[index].id, stage, &error);
        self.report(run, index, outcome).await;
    }

    async fn report(&self, run: &mut BatchRun, index: usize, outcome: CommitOutcome) {
        let commit = &run.commits[index];
        let report = CommitReport {
            batch_id: run.batch_id.clone(),
            commit_id: commit.id.clone(),
            permalink: commit.permalink.clone(),
            outcome,
        };
        self.hook.commit_completed(&report).await;
        run.reports.push(report);
    }

    /// Report the rest of the batch as abandoned, once.
    async fn abort(&self, run: &mut BatchRun, reason: &EnvError) {
        let report = BatchAbortReport {
            batch_id: run.batch_id.clone(),
            reason: format!("environment construction failed: {reason}"),
            remaining: run.unfinished(),
        };
        obs::emit_batch_aborted(&run.batch_id, report.remaining.len(), reason);
        self.hook.batch_aborted(&report).await;
        run.aborted = Some(report);
    }
}

fn fetch_failed(e: &dyn std::fmt::Display) -> CommitOutcome {
    CommitOutcome::FetchFailed {
        error: e.to_string(),
    }
}

async fn discard(extracted: &ExtractedSnapshot) {
    if let Err(e) = extracted.discard().await {
        warn!(
            path = %extracted.workspace.display(),
            error = %e,
            "failed to remove working directory"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fakes::{FakeFetcher, FakeProvisioner, RecordingHook, ScriptedExecutor};

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_batch_future_is_send() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new("acme/widgets", dir.path());
        let orchestrator = BuildOrchestrator::new(
            Arc::new(Context::new(config.clone())),
            Arc::new(FakeFetcher::new()),
            Arc::new(FakeProvisioner::new(config.env_dir())),
            Arc::new(ScriptedExecutor::new()),
            Arc::new(RecordingHook::new()),
        );
        // Spawned by BuildService, so it must cross threads.
        assert_send(orchestrator.run_batch(CommitBatch::default()));
        assert_send(orchestrator.run_batch_as("b-1".to_string(), CommitBatch::default()));
    }

    #[test]
    fn test_unfinished_skips_terminal_commits() {
        let ts = chrono::Utc::now();
        let ids: Vec<CommitId> = ['1', '2', '3']
            .iter()
            .map(|c| CommitId::parse(&c.to_string().repeat(40)).unwrap())
            .collect();
        let mut run = BatchRun {
            batch_id: "b-2".to_string(),
            commits: ids.iter().map(|id| Commit::new(id.clone(), "", ts)).collect(),
            states: vec![CommitState::Pending; 3],
            reports: Vec::new(),
            aborted: None,
            recreated: false,
        };
        run.transition(0, CommitState::Published);
        run.transition(1, CommitState::Building);
        assert_eq!(run.unfinished(), vec![ids[1].clone(), ids[2].clone()]);
    }
}
