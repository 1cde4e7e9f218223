//! Completion hooks: where per-commit and batch-abort outcomes are reported.
//!
//! Hooks never fail the pipeline. Delivery problems are logged and dropped.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::CommitId;

/// What happened to one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Published {
        path: PathBuf,
    },
    FetchFailed {
        error: String,
    },
    BuildFailed {
        error: String,
        /// Whether the build was retried in a recreated environment.
        retried: bool,
    },
    /// Built fine but could not be moved into the store. The staged output
    /// is left in place for manual recovery.
    PublishFailed {
        error: String,
        staging_dir: PathBuf,
    },
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitOutcome::Published { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CommitOutcome::Published { .. } => None,
            CommitOutcome::FetchFailed { error }
            | CommitOutcome::BuildFailed { error, .. }
            | CommitOutcome::PublishFailed { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub batch_id: String,
    pub commit_id: CommitId,
    pub permalink: String,
    #[serde(flatten)]
    pub outcome: CommitOutcome,
}

/// A batch stopped early because no build environment could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchAbortReport {
    pub batch_id: String,
    pub reason: String,
    /// Commits that were never built (every commit of the batch if the
    /// batch task itself died).
    pub remaining: Vec<CommitId>,
}

#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn commit_completed(&self, report: &CommitReport);

    async fn batch_aborted(&self, report: &BatchAbortReport);
}

/// Hook that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHook;

#[async_trait]
impl CompletionHook for LogHook {
    async fn commit_completed(&self, report: &CommitReport) {
        match report.outcome.error() {
            None => info!(
                commit = %report.commit_id.short(),
                permalink = %report.permalink,
                "documentation published"
            ),
            Some(e) => warn!(
                commit = %report.commit_id.short(),
                error = %e,
                "commit not published"
            ),
        }
    }

    async fn batch_aborted(&self, report: &BatchAbortReport) {
        error!(
            batch_id = %report.batch_id,
            remaining = report.remaining.len(),
            reason = %report.reason,
            "batch aborted"
        );
    }
}

#[derive(Serialize)]
#[serde(tag = "event")]
enum HookPayload<'a> {
    #[serde(rename = "commit.completed")]
    CommitCompleted { report: &'a CommitReport },
    #[serde(rename = "batch.aborted")]
    BatchAborted { report: &'a BatchAbortReport },
}

/// Hook that POSTs each report as JSON to a URL.
pub struct HttpHook {
    client: reqwest::Client,
    url: String,
}

impl HttpHook {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("docwright/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpHook {
            client,
            url: url.into(),
        })
    }

    async fn deliver(&self, payload: &HookPayload<'_>) {
        match self.client.post(&self.url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                url = %self.url,
                status = resp.status().as_u16(),
                "completion hook rejected"
            ),
            Err(e) => warn!(url = %self.url, error = %e, "completion hook delivery failed"),
        }
    }
}

#[async_trait]
impl CompletionHook for HttpHook {
    async fn commit_completed(&self, report: &CommitReport) {
        self.deliver(&HookPayload::CommitCompleted { report }).await;
    }

    async fn batch_aborted(&self, report: &BatchAbortReport) {
        self.deliver(&HookPayload::BatchAborted { report }).await;
    }
}
