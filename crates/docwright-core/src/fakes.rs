//! Fakes for the pipeline's collaborator traits (testing only)
//!
//! They touch the real filesystem (tarballs, staging directories) so the
//! orchestrator's publish/extract paths run for real, but never spawn
//! processes or open sockets.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use env_provisioner::{EnvError, Environment, EnvironmentProvisioner, EnvironmentState};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::domain::{CommitId, Credential};
use crate::executor::{
    BuildExecutor, BuildFailure, BuildFailureKind, StagedBuild, Transcript, TranscriptEntry,
    BUILD_LOG_FILE,
};
use crate::fetch::{FetchError, FetchResult, FetchedSnapshot, SnapshotFetcher};
use crate::hook::{BatchAbortReport, CommitReport, CompletionHook};

/// File in every fake source tree naming the commit it came from.
pub const COMMIT_FILE: &str = "COMMIT";

/// File in every fake environment holding its construction number.
pub const GENERATION_FILE: &str = "generation";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write a gzip tarball whose single top-level directory is `root`.
pub fn write_source_archive(path: &Path, root: &str, files: &[(&str, &str)]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o755);
    dir.set_size(0);
    builder.append_data(&mut dir, format!("{root}/"), io::empty())?;

    for (rel, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        builder.append_data(&mut header, format!("{root}/{rel}"), contents.as_bytes())?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// FakeFetcher
// ---------------------------------------------------------------------------

/// Fetcher that writes a small Python project tarball per commit.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    failing: Mutex<HashSet<CommitId>>,
    fetched: Mutex<Vec<CommitId>>,
    credentials: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
    delays: Mutex<HashMap<CommitId, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every fetch for `delay`, so concurrency can be observed.
    pub fn with_delay(delay: Duration) -> Self {
        FakeFetcher {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Hold fetches of `id` for `delay` instead of the shared delay.
    pub fn delay_for(&self, id: &CommitId, delay: Duration) {
        lock(&self.delays).insert(id.clone(), delay);
    }

    /// Make fetches of `id` fail with HTTP 404.
    pub fn fail_for(&self, id: &CommitId) {
        lock(&self.failing).insert(id.clone());
    }

    /// Commits fetched so far, in completion order.
    pub fn fetched(&self) -> Vec<CommitId> {
        lock(&self.fetched).clone()
    }

    /// Raw tokens seen, one per fetch.
    pub fn credentials(&self) -> Vec<Option<String>> {
        lock(&self.credentials).clone()
    }

    /// Highest number of fetches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for FakeFetcher {
    async fn fetch(
        &self,
        commit: &CommitId,
        credential: Option<&Credential>,
        dest_dir: &Path,
    ) -> FetchResult<FetchedSnapshot> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.credentials).push(credential.map(|c| c.expose().to_string()));

        let delay = lock(&self.delays).get(commit).copied().or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.write_archive(commit, dest_dir);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.fetched).push(commit.clone());
        result
    }
}

impl FakeFetcher {
    fn write_archive(&self, commit: &CommitId, dest_dir: &Path) -> FetchResult<FetchedSnapshot> {
        if lock(&self.failing).contains(commit) {
            return Err(FetchError::Status {
                url: format!("fake://tarball/{commit}"),
                status: 404,
            });
        }

        std::fs::create_dir_all(dest_dir)?;
        let archive = dest_dir.join(format!("{commit}.tar.gz"));
        let root = format!("acme-widgets-{}", commit.short());
        write_source_archive(
            &archive,
            &root,
            &[
                (COMMIT_FILE, commit.as_str()),
                ("setup.py", "from setuptools import setup\nsetup(name='widgets')\n"),
                ("docs/index.rst", "Widgets\n=======\n"),
            ],
        )?;
        let bytes = std::fs::metadata(&archive)?.len();
        Ok(FetchedSnapshot {
            commit: commit.clone(),
            archive,
            bytes,
            sha256: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// FakeProvisioner
// ---------------------------------------------------------------------------

/// Provisioner that "constructs" by creating a directory and numbering it.
#[derive(Debug)]
pub struct FakeProvisioner {
    root: PathBuf,
    constructions: AtomicUsize,
    attempts: AtomicUsize,
    /// Construction attempts numbered at or above this fail.
    fail_from: Mutex<Option<usize>>,
    state: Mutex<EnvironmentState>,
}

impl FakeProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FakeProvisioner {
            root: root.into(),
            constructions: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            fail_from: Mutex::new(None),
            state: Mutex::new(EnvironmentState::Absent),
        }
    }

    /// Every construction attempt fails.
    pub fn failing(root: impl Into<PathBuf>) -> Self {
        let provisioner = Self::new(root);
        provisioner.fail_from(1);
        provisioner
    }

    /// Attempt number `attempt` (1-based) and every later one fail.
    pub fn fail_from(&self, attempt: usize) {
        *lock(&self.fail_from) = Some(attempt);
    }

    /// Successful constructions so far.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentProvisioner for FakeProvisioner {
    async fn ensure(&self, recreate: bool) -> env_provisioner::Result<Environment> {
        if !recreate && *lock(&self.state) == EnvironmentState::Ready {
            return Ok(Environment::new(&self.root));
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        let fail_from = *lock(&self.fail_from);
        if fail_from.is_some_and(|from| attempt >= from) {
            *lock(&self.state) = EnvironmentState::Absent;
            return Err(EnvError::ConstructionFailed {
                command: "fake-venv".to_string(),
                status: "exit status: 1".to_string(),
                output: format!("construction attempt {attempt} refused"),
            });
        }

        let generation = self.constructions.fetch_add(1, Ordering::SeqCst) + 1;
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.root.join(GENERATION_FILE), generation.to_string())?;
        *lock(&self.state) = EnvironmentState::Ready;
        Ok(Environment::new(&self.root))
    }

    fn state(&self) -> EnvironmentState {
        *lock(&self.state)
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Fail the first n builds of the commit.
    FailTimes(usize),
    /// Fail while the environment generation is below g.
    FailBeforeGeneration(usize),
    Panic,
}

/// One build the executor was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub commit: CommitId,
    pub generation: usize,
    pub succeeded: bool,
}

/// Executor whose outcome per commit is scripted up front.
///
/// The commit is read from the tree's `COMMIT` file and the environment
/// generation from the environment's `generation` file, so it only works
/// with [`FakeFetcher`] and [`FakeProvisioner`].
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<CommitId, Script>>,
    attempts: Mutex<HashMap<CommitId, usize>>,
    builds: Mutex<Vec<BuildRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, id: &CommitId, times: usize) {
        lock(&self.scripts).insert(id.clone(), Script::FailTimes(times));
    }

    /// Fail every build of `id` until the environment has been constructed
    /// `generation` times.
    pub fn fail_before_generation(&self, id: &CommitId, generation: usize) {
        lock(&self.scripts).insert(id.clone(), Script::FailBeforeGeneration(generation));
    }

    pub fn panic_on(&self, id: &CommitId) {
        lock(&self.scripts).insert(id.clone(), Script::Panic);
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        lock(&self.builds).clone()
    }

    /// Highest number of builds observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn run(&self, source_tree: &Path, env: &Environment) -> Result<StagedBuild, BuildFailure> {
        let io_failure = |e: io::Error| BuildFailure {
            kind: BuildFailureKind::Io(e.to_string()),
            transcript: Transcript::default(),
        };
        let text = std::fs::read_to_string(source_tree.join(COMMIT_FILE)).map_err(io_failure)?;
        let commit = CommitId::parse(text.trim()).map_err(|e| BuildFailure {
            kind: BuildFailureKind::Io(e.to_string()),
            transcript: Transcript::default(),
        })?;
        let generation = std::fs::read_to_string(env.root().join(GENERATION_FILE))
            .ok()
            .and_then(|g| g.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let attempt = {
            let mut attempts = lock(&self.attempts);
            let n = attempts.entry(commit.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let script = lock(&self.scripts).get(&commit).copied();
        let fails = match script {
            Some(Script::FailTimes(n)) => attempt <= n,
            Some(Script::FailBeforeGeneration(g)) => generation < g,
            Some(Script::Panic) => panic!("scripted panic building {commit}"),
            None => false,
        };

        let command = format!("fake-build {}", commit.short());
        let mut transcript = Transcript::default();
        lock(&self.builds).push(BuildRecord {
            commit: commit.clone(),
            generation,
            succeeded: !fails,
        });

        if fails {
            transcript.push(TranscriptEntry {
                command: command.clone(),
                output: format!("attempt {attempt} failed in environment {generation}\n"),
                exit_code: Some(1),
            });
            return Err(BuildFailure {
                kind: BuildFailureKind::StepFailed {
                    command,
                    status: "exit status: 1".to_string(),
                },
                transcript,
            });
        }

        transcript.push(TranscriptEntry {
            command,
            output: "build succeeded.\n".to_string(),
            exit_code: Some(0),
        });
        let output_dir = source_tree.join("build").join("html");
        std::fs::create_dir_all(&output_dir).map_err(io_failure)?;
        std::fs::write(
            output_dir.join("index.html"),
            format!("<h1>{commit}</h1>\n"),
        )
        .map_err(io_failure)?;
        std::fs::write(output_dir.join(BUILD_LOG_FILE), transcript.render()).map_err(io_failure)?;
        Ok(StagedBuild {
            output_dir,
            transcript,
        })
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn build(
        &self,
        source_tree: &Path,
        env: &Environment,
    ) -> Result<StagedBuild, BuildFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = self.run(source_tree, env);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// RecordingHook
// ---------------------------------------------------------------------------

/// Hook that keeps every report it receives.
#[derive(Debug, Default)]
pub struct RecordingHook {
    reports: Mutex<Vec<CommitReport>>,
    aborts: Mutex<Vec<BatchAbortReport>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<CommitReport> {
        lock(&self.reports).clone()
    }

    pub fn aborts(&self) -> Vec<BatchAbortReport> {
        lock(&self.aborts).clone()
    }
}

#[async_trait]
impl CompletionHook for RecordingHook {
    async fn commit_completed(&self, report: &CommitReport) {
        lock(&self.reports).push(report.clone());
    }

    async fn batch_aborted(&self, report: &BatchAbortReport) {
        lock(&self.aborts).push(report.clone());
    }
}
