//! Docwright Core Library
//!
//! Builds documentation for every pushed commit, in commit order, and
//! publishes each result under its commit id. See [`BuildOrchestrator`] for
//! the pipeline and [`ArtifactStore`] for how published output is found.

pub mod config;
pub mod context;
pub mod domain;
pub mod executor;
pub mod fakes;
pub mod fetch;
pub mod hook;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod payload;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod telemetry;

pub use config::{BuildConfig, Config, EnvironmentConfig, FetchConfig};
pub use context::Context;
pub use domain::{
    is_hex, Commit, CommitBatch, CommitId, Credential, DocwrightError, Result, COMMIT_ID_LEN,
    MIN_ABBREV_LEN,
};
pub use executor::{
    BuildExecutor, BuildFailure, BuildFailureKind, CommandExecutor, StagedBuild, Transcript,
    TranscriptEntry, BUILD_LOG_FILE,
};
pub use fetch::{FetchError, FetchResult, FetchedSnapshot, HttpSnapshotFetcher, SnapshotFetcher};
pub use hook::{BatchAbortReport, CommitOutcome, CommitReport, CompletionHook, HttpHook, LogHook};
pub use metrics::METRICS;
pub use orchestrator::{BatchState, BatchSummary, BuildOrchestrator, CommitProgress, CommitState};
pub use payload::{PushCommit, PushEvent};
pub use service::{BuildService, SubmitError, DEFAULT_QUEUE_CAPACITY};
pub use snapshot::{extract_snapshot, ExtractedSnapshot};
pub use store::{ArtifactEntry, ArtifactStore, Resolution, StoreError, StoreResult, HEAD_REF};

pub use env_provisioner::{
    CommandProvisioner, EnvError, Environment, EnvironmentProvisioner, EnvironmentState,
};
