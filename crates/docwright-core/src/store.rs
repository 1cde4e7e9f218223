//! Artifact store and resolver.
//!
//! Layout: `<root>/<40 hex chars>/` per published commit, plus `head.txt`.
//! Anything else under the root (`_env`, `_work`, `token.txt`) is not an
//! artifact and is never listed or resolved.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::HEAD_FILE;
use crate::domain::{is_hex, CommitId, COMMIT_ID_LEN, MIN_ABBREV_LEN};
use crate::executor::BUILD_LOG_FILE;

/// The symbolic reference resolved through the head pointer.
pub const HEAD_REF: &str = "head";

/// Page served when a request names a directory.
pub const DEFAULT_PAGE: &str = "index.html";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact for {0} is already published")]
    AlreadyPublished(CommitId),

    #[error("artifact for {0} is being published by another process")]
    PublishInProgress(CommitId),

    #[error("staging directory {} does not exist", .0.display())]
    MissingStaging(PathBuf),

    #[error("head pointer is corrupt: {0:?}")]
    CorruptHead(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found {
        commit_id: CommitId,
        path: PathBuf,
        /// The reference was not the canonical full id; callers serving
        /// requests should redirect to it.
        redirect: bool,
    },
    NotFound,
    /// An abbreviated id matched more than one artifact.
    Ambiguous(Vec<CommitId>),
}

/// One row of [`ArtifactStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    pub commit_id: CommitId,
    pub published_at: DateTime<Utc>,
    pub has_log: bool,
}

/// Published artifacts plus the head pointer.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, id: &CommitId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn head_path(&self) -> PathBuf {
        self.root.join(HEAD_FILE)
    }

    /// Move `staged` into place under `id`.
    ///
    /// A single rename within the same filesystem, so readers see either no
    /// artifact or the complete one. An existing artifact is never replaced;
    /// on any error `staged` is left where it is.
    ///
    /// `rename` would silently replace an empty directory, so publishers in
    /// different processes first claim the id with an exclusively created
    /// `.<id>.publishing` file. A claim left behind by a crashed publisher
    /// has to be removed by hand.
    pub fn publish(&self, id: &CommitId, staged: &Path) -> StoreResult<PathBuf> {
        if !staged.is_dir() {
            return Err(StoreError::MissingStaging(staged.to_path_buf()));
        }
        fs::create_dir_all(&self.root)?;

        let claim = self.claim_path(id);
        match fs::OpenOptions::new().write(true).create_new(true).open(&claim) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::PublishInProgress(id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.publish_claimed(id, staged);
        if let Err(e) = fs::remove_file(&claim) {
            warn!(path = %claim.display(), error = %e, "failed to release publish claim");
        }
        result
    }

    fn publish_claimed(&self, id: &CommitId, staged: &Path) -> StoreResult<PathBuf> {
        let dest = self.artifact_path(id);
        if dest.exists() {
            return Err(StoreError::AlreadyPublished(id.clone()));
        }
        fs::rename(staged, &dest)?;
        info!(commit = %id.short(), path = %dest.display(), "artifact published");
        Ok(dest)
    }

    fn claim_path(&self, id: &CommitId) -> PathBuf {
        self.root.join(format!(".{id}.publishing"))
    }

    /// Current head pointer, if one has been written.
    pub fn head(&self) -> StoreResult<Option<CommitId>> {
        let text = match fs::read_to_string(self.head_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        CommitId::parse(text)
            .map(Some)
            .map_err(|_| StoreError::CorruptHead(text.to_string()))
    }

    /// Point head at `id`. Written via temp file + rename.
    pub fn set_head(&self, id: &CommitId) -> StoreResult<()> {
        fs::create_dir_all(&self.root)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(id.as_str().as_bytes())?;
        tmp.persist(self.head_path()).map_err(|e| e.error)?;
        debug!(commit = %id.short(), "head pointer updated");
        Ok(())
    }

    /// Resolve `head`, a full id, or an abbreviated id of 7–39 hex chars.
    pub fn resolve(&self, reference: &str) -> StoreResult<Resolution> {
        if reference == HEAD_REF {
            let Some(id) = self.head()? else {
                return Ok(Resolution::NotFound);
            };
            return Ok(self.found(id, true));
        }

        let len = reference.len();
        if !is_hex(reference) || !(MIN_ABBREV_LEN..=COMMIT_ID_LEN).contains(&len) {
            return Ok(Resolution::NotFound);
        }

        if len == COMMIT_ID_LEN {
            let Ok(id) = CommitId::parse(reference) else {
                return Ok(Resolution::NotFound);
            };
            let redirect = id.as_str() != reference;
            return Ok(self.found(id, redirect));
        }

        let prefix = reference.to_ascii_lowercase();
        let mut matches: Vec<CommitId> = self
            .published_ids()?
            .into_iter()
            .filter(|id| id.as_str().starts_with(&prefix))
            .collect();
        matches.sort();

        Ok(match matches.len() {
            0 => Resolution::NotFound,
            1 => {
                let id = matches.remove(0);
                self.found(id, true)
            }
            _ => Resolution::Ambiguous(matches),
        })
    }

    fn found(&self, id: CommitId, redirect: bool) -> Resolution {
        let path = self.artifact_path(&id);
        if path.is_dir() {
            Resolution::Found {
                commit_id: id,
                path,
                redirect,
            }
        } else {
            Resolution::NotFound
        }
    }

    /// Every published artifact. Unordered.
    pub fn list(&self) -> StoreResult<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();
        for id in self.published_ids()? {
            let path = self.artifact_path(&id);
            let published_at = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => DateTime::<Utc>::from(mtime),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
                    continue;
                }
            };
            entries.push(ArtifactEntry {
                has_log: path.join(BUILD_LOG_FILE).is_file(),
                commit_id: id,
                published_at,
            });
        }
        Ok(entries)
    }

    fn published_ids(&self) -> StoreResult<Vec<CommitId>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Only lowercase names are ever published.
            if name.len() != COMMIT_ID_LEN || name != name.to_ascii_lowercase() {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = CommitId::parse(&name) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Map a request path inside a resolved artifact to a file.
    ///
    /// Empty paths and directories map to [`DEFAULT_PAGE`]. Absolute paths,
    /// `..` components and missing files give `None`.
    pub fn file_path(&self, artifact: &Path, rel: &str) -> Option<PathBuf> {
        let rel = Path::new(rel);
        let mut path = artifact.to_path_buf();
        for component in rel.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if path.is_dir() {
            path.push(DEFAULT_PAGE);
        }
        path.is_file().then_some(path)
    }
}
