//! Environment provisioning: create once, reuse, recreate on demand
//!
//! The provisioner keeps no memory of how often it has been asked to
//! recreate; that policy belongs to the caller.

use crate::environment::{render_command, Environment};
use crate::error::EnvError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Marker written once construction has fully succeeded
pub const READY_MARKER: &str = ".docwright-ready";

/// Observable state of the environment directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// Nothing at the well-known location
    Absent,
    /// Constructed and usable
    Ready,
    /// Directory exists but construction never finished
    Incomplete,
}

/// Something that can hand out a usable build environment
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Return the cached environment, or build a fresh one when `recreate`
    /// is set or nothing usable exists yet.
    async fn ensure(&self, recreate: bool) -> Result<Environment>;

    /// Current state of the environment location
    fn state(&self) -> EnvironmentState;
}

/// Settings for [`CommandProvisioner`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Well-known location of the environment
    pub root: PathBuf,
    /// Construction argv template (see [`Environment::expand`])
    pub create_command: Vec<String>,
    /// Upper bound for one construction run
    pub timeout: Duration,
}

impl ProvisionerConfig {
    /// Config that builds a Python virtualenv at `root`
    pub fn virtualenv(root: impl Into<PathBuf>) -> Self {
        ProvisionerConfig {
            root: root.into(),
            create_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "venv".to_string(),
                "{env}".to_string(),
            ],
            timeout: Duration::from_secs(600),
        }
    }
}

/// Provisioner that runs an external command to construct the environment
pub struct CommandProvisioner {
    config: ProvisionerConfig,
}

impl CommandProvisioner {
    /// Create a new provisioner
    pub fn new(config: ProvisionerConfig) -> Self {
        CommandProvisioner { config }
    }

    /// Location of the environment
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Remove the environment. Idempotent.
    pub async fn destroy(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.config.root).await {
            Ok(()) => {
                info!(path = %self.config.root.display(), "environment removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EnvError::Io(e)),
        }
    }

    async fn construct(&self) -> Result<Environment> {
        if self.config.create_command.is_empty() {
            return Err(EnvError::EmptyCommand);
        }

        let env = Environment::new(&self.config.root);
        let argv = env.expand(&self.config.create_command, None);
        let command = render_command(&argv);

        if let Some(parent) = self.config.root.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(command = %command, "creating new environment");

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EnvError::Spawn {
                command: command.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.discard_partial().await;
                return Err(EnvError::Io(e));
            }
            Err(_) => {
                self.discard_partial().await;
                return Err(EnvError::Timeout {
                    command,
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            self.discard_partial().await;
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(EnvError::ConstructionFailed {
                command,
                status: output.status.to_string(),
                output: combined,
            });
        }

        if let Err(e) = self.mark_ready(&command).await {
            self.discard_partial().await;
            return Err(EnvError::Io(e));
        }

        info!(path = %self.config.root.display(), "created environment");
        Ok(env)
    }

    async fn mark_ready(&self, command: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.root).await?;
        tokio::fs::write(self.config.root.join(READY_MARKER), command.as_bytes()).await
    }

    async fn discard_partial(&self) {
        if let Err(e) = self.destroy().await {
            warn!(error = %e, "failed to remove partially built environment");
        }
    }
}

#[async_trait]
impl EnvironmentProvisioner for CommandProvisioner {
    async fn ensure(&self, recreate: bool) -> Result<Environment> {
        match self.state() {
            EnvironmentState::Ready if !recreate => {
                debug!(path = %self.config.root.display(), "environment already exists; reusing");
                return Ok(Environment::new(&self.config.root));
            }
            EnvironmentState::Absent => {}
            state => {
                info!(path = %self.config.root.display(), ?state, "environment exists; removing");
                self.destroy().await?;
            }
        }

        self.construct().await
    }

    fn state(&self) -> EnvironmentState {
        let root = &self.config.root;
        if !root.exists() {
            EnvironmentState::Absent
        } else if root.is_dir() && root.join(READY_MARKER).is_file() {
            EnvironmentState::Ready
        } else {
            EnvironmentState::Incomplete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn provisioner(root: &Path, script: &str) -> CommandProvisioner {
        CommandProvisioner::new(ProvisionerConfig {
            root: root.to_path_buf(),
            create_command: shell(script),
            timeout: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_virtualenv_config() {
        let config = ProvisionerConfig::virtualenv("/srv/_env");
        assert_eq!(config.create_command[0], "python3");
        assert_eq!(config.create_command[3], "{env}");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempdir().unwrap();
        let p = CommandProvisioner::new(ProvisionerConfig {
            root: dir.path().join("_env"),
            create_command: vec![],
            timeout: Duration::from_secs(1),
        });
        assert!(matches!(p.ensure(false).await, Err(EnvError::EmptyCommand)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempdir().unwrap();
        let p = provisioner(&dir.path().join("_env"), "true");
        p.destroy().await.unwrap();
        p.destroy().await.unwrap();
        assert_eq!(p.state(), EnvironmentState::Absent);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_incomplete_directory_is_rebuilt() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("_env");
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("stale"), b"half built").unwrap();

        let p = provisioner(&root, "mkdir -p {bin}");
        assert_eq!(p.state(), EnvironmentState::Incomplete);

        p.ensure(false).await.unwrap();
        assert_eq!(p.state(), EnvironmentState::Ready);
        assert!(!root.join("stale").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_io_failure_after_construction_removes_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("_env");
        // A directory where the ready marker should go makes the final write fail.
        let p = provisioner(&root, "mkdir -p {env}/.docwright-ready {bin}");

        let err = p.ensure(false).await.unwrap_err();
        assert!(matches!(err, EnvError::Io(_)), "{err}");
        assert!(!root.exists());
        assert_eq!(p.state(), EnvironmentState::Absent);
    }
}
