//! Runtime context shared by every component.
//!
//! The context is loaded once at startup. The credential it caches is only
//! re-read when [`Context::refresh_credential`] is called; a running batch
//! never re-derives it.

use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{Credential, DocwrightError, Result};

/// Loaded configuration plus the cached access credential.
#[derive(Debug)]
pub struct Context {
    config: Config,
    credential: RwLock<Option<Credential>>,
}

impl Context {
    /// Build a context from an already validated config.
    ///
    /// An unreadable token file is logged and treated as "no credential".
    pub fn new(config: Config) -> Self {
        let credential = read_credential(&config).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read stored access token");
            None
        });
        Context {
            config,
            credential: RwLock::new(credential),
        }
    }

    /// Load a TOML config file and build the context.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Config::load(path)?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cached credential, if any.
    pub fn credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the credential from config / `token.txt` and cache it.
    pub fn refresh_credential(&self) -> Result<Option<Credential>> {
        let fresh = read_credential(&self.config)?;
        *self
            .credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh.clone();
        info!(present = fresh.is_some(), "access token refreshed");
        Ok(fresh)
    }

    /// Persist a new token to `token.txt` and cache it.
    pub fn store_credential(&self, token: &str) -> Result<Credential> {
        let credential = Credential::new(token)
            .ok_or_else(|| DocwrightError::Config("access token must not be empty".to_string()))?;

        std::fs::create_dir_all(&self.config.save_directory)?;
        let mut tmp = NamedTempFile::new_in(&self.config.save_directory)?;
        tmp.write_all(credential.expose().as_bytes())?;
        tmp.persist(self.config.token_file()).map_err(|e| e.error)?;

        *self
            .credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential.clone());
        info!(path = %self.config.token_file().display(), "access token stored");
        Ok(credential)
    }
}

fn read_credential(config: &Config) -> Result<Option<Credential>> {
    if let Some(token) = &config.access_token {
        return Ok(Credential::new(token));
    }
    match std::fs::read_to_string(config.token_file()) {
        Ok(text) => Ok(Credential::new(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
