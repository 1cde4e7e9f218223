//! Commit identifiers and commit batches.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential::Credential;
use super::error::DocwrightError;

/// Length of a full commit identifier in hex characters.
pub const COMMIT_ID_LEN: usize = 40;

/// Shortest accepted abbreviated identifier.
pub const MIN_ABBREV_LEN: usize = 7;

/// Returns `true` if `s` is non-empty and entirely ASCII hex.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Full 40-character commit identifier.
///
/// Identifiers are case-insensitive; the stored form is always lowercase so
/// that it can be used directly as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Parse and normalise a full identifier.
    pub fn parse(s: &str) -> Result<Self, DocwrightError> {
        if s.len() != COMMIT_ID_LEN || !is_hex(s) {
            return Err(DocwrightError::InvalidCommitId(s.to_string()));
        }
        Ok(CommitId(s.to_ascii_lowercase()))
    }

    /// Full lowercase hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 7 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..MIN_ABBREV_LEN]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommitId {
    type Err = DocwrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommitId::parse(s)
    }
}

impl TryFrom<String> for CommitId {
    type Error = DocwrightError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        CommitId::parse(&s)
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

/// One pushed commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    /// Where the published docs for this commit will live; only used in reports.
    pub permalink: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn new(id: CommitId, permalink: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Commit {
            id,
            permalink: permalink.into(),
            timestamp,
        }
    }
}

/// The commits delivered by one push, in chronological order.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    commits: Vec<Commit>,
    credential: Option<Credential>,
}

impl CommitBatch {
    /// Build a batch from commits in any order.
    ///
    /// Commits are sorted by timestamp ascending (stable, so equal timestamps
    /// keep their delivery order) and later duplicates of an id are dropped.
    pub fn new(mut commits: Vec<Commit>) -> Self {
        commits.sort_by_key(|c| c.timestamp);
        let mut seen = HashSet::new();
        commits.retain(|c| seen.insert(c.id.clone()));
        CommitBatch {
            commits,
            credential: None,
        }
    }

    /// Attach a credential that overrides the shared one for this batch.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Commit>, Option<Credential>) {
        (self.commits, self.credential)
    }
}
