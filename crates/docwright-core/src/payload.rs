//! Push notification payloads.
//!
//! Only the fields needed to build a [`CommitBatch`] are read; everything
//! else in the document is ignored.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::Config;
use crate::domain::{Commit, CommitBatch, CommitId, DocwrightError, Result};

/// A push notification as delivered by the repository host.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    pub commits: Vec<PushCommit>,
}

/// One commit entry of a push notification.
#[derive(Debug, Clone, Deserialize)]
pub struct PushCommit {
    pub id: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

impl PushEvent {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DocwrightError::Payload(e.to_string()))
    }

    /// Validate every commit and turn the event into a chronological batch.
    pub fn into_batch(self, config: &Config) -> Result<CommitBatch> {
        let commits = self
            .commits
            .into_iter()
            .map(|c| {
                let id = CommitId::parse(&c.id)?;
                let timestamp = DateTime::parse_from_rfc3339(&c.timestamp)
                    .map_err(|e| {
                        DocwrightError::Payload(format!(
                            "commit {} has invalid timestamp {:?}: {}",
                            c.id, c.timestamp, e
                        ))
                    })?
                    .with_timezone(&Utc);
                let permalink = config.permalink(&id);
                Ok(Commit::new(id, permalink, timestamp))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CommitBatch::new(commits))
    }
}
