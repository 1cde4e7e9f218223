//! Build executor: run the documentation toolchain against a source tree.
//!
//! Every command line and its output is appended to a [`Transcript`]. On
//! success the transcript is written into the output directory as
//! `build.txt`; on failure it travels with the [`BuildFailure`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use env_provisioner::{render_command, Environment};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::BuildConfig;

/// Build log file name inside every published artifact.
pub const BUILD_LOG_FILE: &str = "build.txt";

/// Environment variable set for every build step.
pub const BUILD_MARKER_VAR: &str = "DOCWRIGHT";

/// One command and what it printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub command: String,
    /// stdout followed by stderr.
    pub output: String,
    /// Exit code; `None` if the process never exited normally.
    pub exit_code: Option<i32>,
}

/// Ordered record of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain-text form: `$ command` followed by its output.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str("$ ");
            text.push_str(&entry.command);
            text.push('\n');
            text.push_str(&entry.output);
            if !entry.output.is_empty() && !entry.output.ends_with('\n') {
                text.push('\n');
            }
        }
        text
    }
}

/// Output of a successful build, still in its staging location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBuild {
    pub output_dir: PathBuf,
    pub transcript: Transcript,
}

/// Why a build failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildFailureKind {
    #[error("`{command}` exited with {status}")]
    StepFailed { command: String, status: String },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("build produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("io error: {0}")]
    Io(String),
}

/// A failed build and everything it printed up to the failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct BuildFailure {
    pub kind: BuildFailureKind,
    pub transcript: Transcript,
}

impl BuildFailure {
    /// Failure reason followed by the full transcript.
    pub fn detail(&self) -> String {
        if self.transcript.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}\n\n{}", self.kind, self.transcript.render())
        }
    }
}

/// Something that turns a source tree into a documentation directory.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn build(
        &self,
        source_tree: &Path,
        env: &Environment,
    ) -> Result<StagedBuild, BuildFailure>;
}

/// Executor driven by a [`BuildConfig`] recipe.
pub struct CommandExecutor {
    recipe: BuildConfig,
}

impl CommandExecutor {
    pub fn new(recipe: BuildConfig) -> Self {
        CommandExecutor { recipe }
    }

    async fn run_steps(
        &self,
        steps: &[Vec<String>],
        source_tree: &Path,
        env: &Environment,
        transcript: &mut Transcript,
    ) -> Result<(), BuildFailureKind> {
        for template in steps {
            let argv = env.expand(template, Some(source_tree));
            run_step(&argv, source_tree, env, self.recipe.step_timeout(), transcript).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BuildExecutor for CommandExecutor {
    async fn build(
        &self,
        source_tree: &Path,
        env: &Environment,
    ) -> Result<StagedBuild, BuildFailure> {
        let mut transcript = Transcript::default();

        info!(source = %source_tree.display(), "installing dependencies");
        let mut outcome = self
            .run_steps(&self.recipe.install, source_tree, env, &mut transcript)
            .await;
        if outcome.is_ok() {
            info!(source = %source_tree.display(), "building documentation");
            outcome = self
                .run_steps(&self.recipe.build, source_tree, env, &mut transcript)
                .await;
        }

        // Cleanup runs on every path; its failures never fail the build.
        for template in &self.recipe.cleanup {
            let argv = env.expand(template, Some(source_tree));
            if let Err(e) =
                run_step(&argv, source_tree, env, self.recipe.step_timeout(), &mut transcript).await
            {
                warn!(error = %e, "cleanup step failed; environment may carry leftovers");
            }
        }

        let fail = |kind, transcript| BuildFailure { kind, transcript };
        if let Err(kind) = outcome {
            return Err(fail(kind, transcript));
        }

        let output_dir = source_tree.join(&self.recipe.output_dir);
        if !output_dir.is_dir() {
            return Err(fail(BuildFailureKind::MissingOutput(output_dir), transcript));
        }
        let log = output_dir.join(BUILD_LOG_FILE);
        if let Err(e) = tokio::fs::write(&log, transcript.render()).await {
            return Err(fail(BuildFailureKind::Io(e.to_string()), transcript));
        }

        info!(output = %output_dir.display(), "documentation built");
        Ok(StagedBuild {
            output_dir,
            transcript,
        })
    }
}

/// `PATH` with the environment's bin directory in front.
fn path_with(bin_dir: &Path) -> OsString {
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let dirs = std::iter::once(bin_dir.to_path_buf()).chain(std::env::split_paths(&existing));
    std::env::join_paths(dirs).unwrap_or_else(|_| bin_dir.as_os_str().to_os_string())
}

async fn run_step(
    argv: &[String],
    cwd: &Path,
    env: &Environment,
    timeout: Duration,
    transcript: &mut Transcript,
) -> Result<(), BuildFailureKind> {
    let command = render_command(argv);
    debug!(command = %command, "running");

    let Some((program, args)) = argv.split_first() else {
        return Err(BuildFailureKind::Spawn {
            command,
            message: "empty command".to_string(),
        });
    };

    let spawned = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env(BUILD_MARKER_VAR, "1")
        .env("VIRTUAL_ENV", env.root())
        .env("PATH", path_with(&env.bin_dir()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            transcript.push(TranscriptEntry {
                command: command.clone(),
                output: e.to_string(),
                exit_code: None,
            });
            return Err(BuildFailureKind::Spawn {
                command,
                message: e.to_string(),
            });
        }
    };

    let collected = tokio::time::timeout(timeout, interleaved_output(&mut child)).await;
    let (combined, status) = match collected {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            transcript.push(TranscriptEntry {
                command: command.clone(),
                output: e.to_string(),
                exit_code: None,
            });
            return Err(BuildFailureKind::Io(e.to_string()));
        }
        Err(_) => {
            transcript.push(TranscriptEntry {
                command: command.clone(),
                output: format!("timed out after {}s", timeout.as_secs()),
                exit_code: None,
            });
            return Err(BuildFailureKind::Timeout {
                command,
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    transcript.push(TranscriptEntry {
        command: command.clone(),
        output: combined,
        exit_code: status.code(),
    });

    if status.success() {
        Ok(())
    } else {
        Err(BuildFailureKind::StepFailed {
            command,
            status: status.to_string(),
        })
    }
}

/// Drain stdout and stderr together, line by line as they arrive, then reap
/// the child. The result reads like a terminal with both streams merged.
async fn interleaved_output(child: &mut Child) -> io::Result<(String, ExitStatus)> {
    let mut stdout = child.stdout.take().map(BufReader::new);
    let mut stderr = child.stderr.take().map(BufReader::new);
    // `read_until` keeps partial reads in these when the other stream wins.
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let mut combined = Vec::new();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_line(&mut stdout, &mut out_line), if stdout.is_some() => {
                if read? == 0 {
                    stdout = None;
                }
                combined.append(&mut out_line);
            }
            read = read_line(&mut stderr, &mut err_line), if stderr.is_some() => {
                if read? == 0 {
                    stderr = None;
                }
                combined.append(&mut err_line);
            }
        }
    }

    let status = child.wait().await?;
    Ok((String::from_utf8_lossy(&combined).into_owned(), status))
}

async fn read_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    match reader {
        Some(reader) => reader.read_until(b'\n', buf).await,
        None => Ok(0),
    }
}
