//! Batch-level behaviour of the build orchestrator, driven through fakes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use docwright_core::fakes::{FakeFetcher, FakeProvisioner, RecordingHook, ScriptedExecutor};
use docwright_core::{
    ArtifactStore, BatchState, BuildOrchestrator, Commit, CommitBatch, CommitId, CommitOutcome,
    Config, Context, Credential, Resolution,
};
use tempfile::TempDir;

fn id(c: char) -> CommitId {
    CommitId::parse(&c.to_string().repeat(40)).unwrap()
}

fn commit(c: char, minute: u32) -> Commit {
    let id = id(c);
    let permalink = format!("https://github.com/acme/widgets/commit/{id}");
    Commit::new(id, permalink, Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap())
}

struct Harness {
    dir: TempDir,
    orchestrator: Arc<BuildOrchestrator>,
    fetcher: Arc<FakeFetcher>,
    provisioner: Arc<FakeProvisioner>,
    executor: Arc<ScriptedExecutor>,
    hook: Arc<RecordingHook>,
}

impl Harness {
    fn new() -> Self {
        Self::build(|_| {}, FakeFetcher::new())
    }

    fn build(configure: impl FnOnce(&mut Config), fetcher: FakeFetcher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("acme/widgets", dir.path());
        configure(&mut config);
        let provisioner = Arc::new(FakeProvisioner::new(config.env_dir()));
        let context = Arc::new(Context::new(config));

        let fetcher = Arc::new(fetcher);
        let executor = Arc::new(ScriptedExecutor::new());
        let hook = Arc::new(RecordingHook::new());
        let orchestrator = Arc::new(BuildOrchestrator::new(
            context,
            fetcher.clone(),
            provisioner.clone(),
            executor.clone(),
            hook.clone(),
        ));
        Harness {
            dir,
            orchestrator,
            fetcher,
            provisioner,
            executor,
            hook,
        }
    }

    fn store(&self) -> ArtifactStore {
        ArtifactStore::new(self.dir.path())
    }

    fn published(&self, c: char) -> bool {
        self.store().artifact_path(&id(c)).join("index.html").is_file()
    }

    fn work_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("_work")
    }
}

fn dir_is_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_head_stays_on_last_success_when_final_commit_fails() {
    let h = Harness::new();
    h.executor.fail_times(&id('2'), 2);

    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2)]))
        .await;

    assert_eq!(summary.state, BatchState::Done);
    assert_eq!(summary.head, Some(id('1')));
    assert_eq!(h.store().head().unwrap(), Some(id('1')));
    assert!(h.published('1'));
    assert!(!h.published('2'));

    let reports = h.hook.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].outcome.is_success());
    match &reports[1].outcome {
        CommitOutcome::BuildFailed { error, retried } => {
            assert!(*retried);
            assert!(error.contains("fake-build"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        reports[1].permalink,
        format!("https://github.com/acme/widgets/commit/{}", id('2'))
    );
    assert_eq!(h.provisioner.constructions(), 2);
    assert!(h.hook.aborts().is_empty());
}

#[tokio::test]
async fn test_out_of_order_input_is_built_chronologically() {
    let h = Harness::new();
    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('3', 30), commit('1', 10), commit('2', 20)]))
        .await;

    let built: Vec<_> = h.executor.builds().into_iter().map(|b| b.commit).collect();
    assert_eq!(built, vec![id('1'), id('2'), id('3')]);
    let reported: Vec<_> = h.hook.reports().into_iter().map(|r| r.commit_id).collect();
    assert_eq!(reported, vec![id('1'), id('2'), id('3')]);
    assert_eq!(summary.head, Some(id('3')));
}

#[tokio::test]
async fn test_slow_oldest_fetch_does_not_reorder_builds() {
    let h = Harness::new();
    h.fetcher.delay_for(&id('1'), Duration::from_millis(200));

    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2), commit('3', 3)]))
        .await;

    // The downloads really did finish out of order.
    assert_eq!(h.fetcher.fetched(), vec![id('2'), id('3'), id('1')]);

    let built: Vec<_> = h.executor.builds().into_iter().map(|b| b.commit).collect();
    assert_eq!(built, vec![id('1'), id('2'), id('3')]);
    let reported: Vec<_> = h.hook.reports().into_iter().map(|r| r.commit_id).collect();
    assert_eq!(reported, vec![id('1'), id('2'), id('3')]);
    assert_eq!(summary.head, Some(id('3')));
    assert_eq!(h.store().head().unwrap(), Some(id('3')));
}

#[tokio::test]
async fn test_only_first_failure_gets_a_fresh_environment() {
    let h = Harness::new();
    h.executor.fail_times(&id('1'), 1);
    h.executor.fail_times(&id('2'), 1);

    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2)]))
        .await;

    assert_eq!(h.provisioner.constructions(), 2);
    assert!(summary.environment_recreated);
    assert_eq!(summary.published(), vec![&id('1')]);
    assert_eq!(summary.failed(), vec![&id('2')]);

    let reports = h.hook.reports();
    assert!(matches!(
        reports[1].outcome,
        CommitOutcome::BuildFailed { retried: false, .. }
    ));
    // c1 twice (fail, retry), c2 once.
    assert_eq!(h.executor.builds().len(), 3);
}

#[tokio::test]
async fn test_stale_environment_recovers_after_recreation() {
    let h = Harness::new();
    h.executor.fail_before_generation(&id('1'), 2);

    let summary = h.orchestrator.run_batch(CommitBatch::new(vec![commit('1', 1)])).await;

    assert_eq!(summary.published(), vec![&id('1')]);
    let generations: Vec<_> = h.executor.builds().iter().map(|b| b.generation).collect();
    assert_eq!(generations, vec![1, 2]);
}

#[tokio::test]
async fn test_environment_failure_at_start_aborts_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new("acme/widgets", dir.path());
    let provisioner = Arc::new(FakeProvisioner::failing(config.env_dir()));
    let hook = Arc::new(RecordingHook::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = BuildOrchestrator::new(
        Arc::new(Context::new(config)),
        Arc::new(FakeFetcher::new()),
        provisioner,
        executor.clone(),
        hook.clone(),
    );

    let summary = orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2), commit('3', 3)]))
        .await;

    assert_eq!(summary.state, BatchState::Aborted);
    assert!(summary.published().is_empty());
    assert!(hook.reports().is_empty());
    assert!(executor.builds().is_empty());

    let aborts = hook.aborts();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].remaining, vec![id('1'), id('2'), id('3')]);
    assert!(aborts[0].reason.contains("environment construction failed"));
    assert_eq!(summary.aborted.as_ref(), Some(&aborts[0]));
    assert_eq!(ArtifactStore::new(dir.path()).head().unwrap(), None);
    assert!(dir_is_empty(&dir.path().join("_work")));
}

#[tokio::test]
async fn test_failed_recreation_mid_batch_keeps_earlier_artifacts() {
    let h = Harness::new();
    h.provisioner.fail_from(2);
    h.executor.fail_times(&id('2'), 5);

    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2), commit('3', 3)]))
        .await;

    assert_eq!(summary.state, BatchState::Aborted);
    assert!(h.published('1'));
    assert!(!h.published('3'));
    assert_eq!(summary.head, Some(id('1')));

    let aborts = h.hook.aborts();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].remaining, vec![id('2'), id('3')]);
    // Only c1 got a per-commit report.
    assert_eq!(h.hook.reports().len(), 1);
    assert!(dir_is_empty(&h.work_dir()));
}

#[tokio::test]
async fn test_fetch_failure_is_isolated_to_its_commit() {
    let h = Harness::new();
    h.fetcher.fail_for(&id('2'));

    let summary = h
        .orchestrator
        .run_batch(CommitBatch::new(vec![commit('1', 1), commit('2', 2), commit('3', 3)]))
        .await;

    assert_eq!(summary.published(), vec![&id('1'), &id('3')]);
    assert_eq!(summary.head, Some(id('3')));
    assert!(!summary.environment_recreated);
    let reports = h.hook.reports();
    match &reports[1].outcome {
        CommitOutcome::FetchFailed { error } => assert!(error.contains("404")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.provisioner.constructions(), 1);
}

#[tokio::test]
async fn test_publish_conflict_keeps_staging_and_existing_artifact() {
    let h = Harness::new();
    let existing = h.store().artifact_path(&id('1'));
    std::fs::create_dir_all(&existing).unwrap();
    std::fs::write(existing.join("index.html"), "original").unwrap();

    let summary = h.orchestrator.run_batch(CommitBatch::new(vec![commit('1', 1)])).await;

    assert_eq!(summary.failed(), vec![&id('1')]);
    assert_eq!(summary.head, None);
    assert_eq!(
        std::fs::read_to_string(existing.join("index.html")).unwrap(),
        "original"
    );
    match &h.hook.reports()[0].outcome {
        CommitOutcome::PublishFailed { staging_dir, error } => {
            assert!(error.contains("already published"));
            assert!(staging_dir.join("index.html").is_file());
            assert!(staging_dir.starts_with(h.work_dir()));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_forced_recreation_uses_up_the_retry() {
    let h = Harness::build(|c| c.recreate_environment = true, FakeFetcher::new());
    h.executor.fail_times(&id('1'), 1);

    let summary = h.orchestrator.run_batch(CommitBatch::new(vec![commit('1', 1)])).await;

    assert!(summary.environment_recreated);
    assert_eq!(h.provisioner.constructions(), 1);
    assert_eq!(summary.failed(), vec![&id('1')]);
    assert_eq!(h.executor.builds().len(), 1);
}

#[tokio::test]
async fn test_environment_is_reused_across_batches() {
    let h = Harness::new();
    h.orchestrator.run_batch(CommitBatch::new(vec![commit('1', 1)])).await;
    h.orchestrator.run_batch(CommitBatch::new(vec![commit('2', 2)])).await;

    assert_eq!(h.provisioner.constructions(), 1);
    assert_eq!(h.store().head().unwrap(), Some(id('2')));
    assert!(matches!(
        h.store().resolve("1111111").unwrap(),
        Resolution::Found { redirect: true, .. }
    ));
}

#[tokio::test]
async fn test_fetches_are_bounded_and_builds_sequential() {
    let h = Harness::build(
        |c| c.fetch.concurrency = 2,
        FakeFetcher::with_delay(Duration::from_millis(20)),
    );
    let commits = ['1', '2', '3', '4', '5']
        .iter()
        .enumerate()
        .map(|(i, c)| commit(*c, i as u32))
        .collect();

    let summary = h.orchestrator.run_batch(CommitBatch::new(commits)).await;

    assert_eq!(summary.published().len(), 5);
    assert!(h.fetcher.max_in_flight() <= 2);
    assert_eq!(h.executor.max_in_flight(), 1);
    assert!(dir_is_empty(&h.work_dir()));
}

#[tokio::test]
async fn test_batch_credential_takes_precedence() {
    let h = Harness::build(
        |c| c.access_token = Some("from-config".to_string()),
        FakeFetcher::new(),
    );

    h.orchestrator.run_batch(CommitBatch::new(vec![commit('1', 1)])).await;
    let batch = CommitBatch::new(vec![commit('2', 2)])
        .with_credential(Credential::new("from-batch").unwrap());
    h.orchestrator.run_batch(batch).await;

    assert_eq!(
        h.fetcher.credentials(),
        vec![Some("from-config".to_string()), Some("from-batch".to_string())]
    );
}

#[tokio::test]
async fn test_overlapping_batches_do_not_interleave() {
    let h = Harness::new();
    let a = Arc::clone(&h.orchestrator);
    let b = Arc::clone(&h.orchestrator);

    let first_batch = CommitBatch::new(vec![commit('1', 1), commit('2', 2)]);
    let second_batch = CommitBatch::new(vec![commit('3', 3), commit('4', 4)]);
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.run_batch(first_batch).await }),
        tokio::spawn(async move { b.run_batch(second_batch).await }),
    );

    assert_eq!(first.unwrap().published().len(), 2);
    assert_eq!(second.unwrap().published().len(), 2);
    assert_eq!(h.executor.max_in_flight(), 1);
    assert_eq!(h.provisioner.constructions(), 1);
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let h = Harness::new();
    let summary = h.orchestrator.run_batch(CommitBatch::new(Vec::new())).await;

    assert_eq!(summary.state, BatchState::Done);
    assert_eq!(h.provisioner.constructions(), 0);
    assert!(h.hook.reports().is_empty());
}
