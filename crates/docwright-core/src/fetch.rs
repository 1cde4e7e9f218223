//! Snapshot fetcher: download a commit's source tarball.
//!
//! Redirects are followed by hand so the hop count can be capped and the
//! credential is only ever sent to the API origin, never to the storage
//! host the API redirects to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{CommitId, Credential};

/// Errors from snapshot downloads. Always attributed to a single commit.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("authorization rejected by {url} (HTTP {status})")]
    Unauthorized { url: String, status: u16 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("redirect from {url} has no usable Location header")]
    BadRedirect { url: String },

    #[error("gave up after {hops} redirects")]
    TooManyRedirects { hops: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// A downloaded, not yet extracted, source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSnapshot {
    pub commit: CommitId,
    pub archive: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the archive, for diagnostics.
    pub sha256: String,
}

/// Source of commit snapshots. Must be safe to call concurrently for
/// distinct commits.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Download the archive for `commit` into `dest_dir`.
    async fn fetch(
        &self,
        commit: &CommitId,
        credential: Option<&Credential>,
        dest_dir: &Path,
    ) -> FetchResult<FetchedSnapshot>;
}

/// Fetcher for the repository host's tarball endpoint.
pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
    api_base: String,
    repository: String,
    max_redirects: usize,
}

impl HttpSnapshotFetcher {
    pub fn new(
        api_base: impl Into<String>,
        repository: impl Into<String>,
        max_redirects: usize,
        timeout: Duration,
    ) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("docwright/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(HttpSnapshotFetcher {
            client,
            api_base: api_base.into(),
            repository: repository.into(),
            max_redirects,
        })
    }

    pub fn from_config(config: &Config) -> FetchResult<Self> {
        Self::new(
            config.api_base.clone(),
            config.repository.clone(),
            config.fetch.max_redirects,
            config.fetch_timeout(),
        )
    }

    /// First URL asked for a commit's tarball.
    pub fn archive_url(&self, commit: &CommitId) -> String {
        format!(
            "{}/repos/{}/tarball/{}",
            self.api_base.trim_end_matches('/'),
            self.repository,
            commit
        )
    }

    async fn resolve(
        &self,
        commit: &CommitId,
        credential: Option<&Credential>,
    ) -> FetchResult<reqwest::Response> {
        let first = self.archive_url(commit);
        let mut url = Url::parse(&first).map_err(|e| FetchError::InvalidUrl {
            url: first.clone(),
            message: e.to_string(),
        })?;
        let api_origin = url.origin();
        let mut hops = 0;

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(credential) = credential {
                if url.origin() == api_origin {
                    let value = format!("token {}", credential.expose());
                    request = request.header(AUTHORIZATION, value);
                }
            }

            let response = request.send().await.map_err(|e| request_error(&url, e))?;
            let status = response.status();

            if status.is_redirection() {
                if hops >= self.max_redirects {
                    return Err(FetchError::TooManyRedirects { hops });
                }
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|location| url.join(location).ok())
                    .ok_or_else(|| FetchError::BadRedirect {
                        url: url.to_string(),
                    })?;
                debug!(commit = %commit.short(), from = %url, to = %next, "following redirect");
                url = next;
                hops += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(FetchError::Unauthorized {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(response);
        }
    }
}

fn request_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Stream a response body to `path` chunk by chunk.
async fn stream_to_file(
    mut response: reqwest::Response,
    path: &Path,
) -> FetchResult<(u64, String)> {
    let url = response.url().clone();
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;

    while let Some(chunk) = response.chunk().await.map_err(|e| request_error(&url, e))? {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;

    Ok((bytes, hex::encode(hasher.finalize())))
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch(
        &self,
        commit: &CommitId,
        credential: Option<&Credential>,
        dest_dir: &Path,
    ) -> FetchResult<FetchedSnapshot> {
        info!(commit = %commit.short(), "start downloading archive");

        let response = self.resolve(commit, credential).await?;
        if let Some(len) = response.content_length() {
            debug!(commit = %commit.short(), content_length = len, "archive size");
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let archive = dest_dir.join(format!("{commit}.tar.gz"));

        let (bytes, sha256) = match stream_to_file(response, &archive).await {
            Ok(done) => done,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&archive).await {
                    warn!(
                        path = %archive.display(),
                        error = %rm,
                        "failed to remove partial archive"
                    );
                }
                return Err(e);
            }
        };

        info!(
            commit = %commit.short(),
            bytes,
            path = %archive.display(),
            "finished downloading archive"
        );
        Ok(FetchedSnapshot {
            commit: commit.clone(),
            archive,
            bytes,
            sha256,
        })
    }
}
