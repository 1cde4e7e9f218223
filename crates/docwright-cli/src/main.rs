//! docwright - operator CLI
//!
//! ## Commands
//!
//! - `build`: run one push payload through the pipeline in the foreground
//! - `resolve`: map `head`, a full id or an abbreviated id to its artifact
//! - `list`: show every published artifact
//! - `head`: print the head pointer
//! - `env`: inspect or (re)build the shared build environment
//! - `token`: store or re-read the repository access token

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use docwright_core::{
    ArtifactStore, BatchState, BuildOrchestrator, CommandProvisioner, Context, Credential,
    EnvironmentProvisioner, PushEvent, Resolution,
};

#[derive(Parser)]
#[command(name = "docwright")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Commit-addressed documentation builds", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "DOCWRIGHT_CONFIG",
        default_value = "docwright.toml"
    )]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every commit of a push payload, oldest first
    Build {
        /// Push payload file (JSON); `-` reads stdin
        #[arg(short, long, default_value = "-")]
        payload: PathBuf,

        /// Access token for this batch only, overriding the stored one
        #[arg(long, env = "DOCWRIGHT_BATCH_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Resolve a reference to its published artifact
    Resolve {
        /// `head`, a full commit id, or an abbreviated id (7+ hex chars)
        reference: String,

        /// File inside the artifact; directories map to their index page
        file: Option<String>,
    },

    /// List published artifacts
    List {
        /// Print JSON instead of a table
        #[arg(long = "as-json")]
        as_json: bool,
    },

    /// Print the head pointer
    Head,

    /// Build environment management
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Access token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    /// Show whether the environment exists and is usable
    Status,
    /// Make sure a usable environment exists
    Ensure {
        /// Throw away the existing environment and build a new one
        #[arg(long)]
        recreate: bool,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Store a new token in the save directory
    Set {
        /// The token; read from stdin when omitted
        token: Option<String>,
    },
    /// Re-read the token from config and disk
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    docwright_core::telemetry::init_tracing(cli.json, level);

    let context = Context::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let context = Arc::new(context);

    match cli.command {
        Commands::Build { payload, token } => cmd_build(context, &payload, token).await,
        Commands::Resolve { reference, file } => cmd_resolve(&context, &reference, file),
        Commands::List { as_json } => cmd_list(&context, as_json),
        Commands::Head => cmd_head(&context),
        Commands::Env { action } => match action {
            EnvAction::Status => cmd_env_status(&context),
            EnvAction::Ensure { recreate } => cmd_env_ensure(&context, recreate).await,
        },
        Commands::Token { action } => match action {
            TokenAction::Set { token } => cmd_token_set(&context, token),
            TokenAction::Refresh => cmd_token_refresh(&context),
        },
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

async fn cmd_build(context: Arc<Context>, payload: &Path, token: Option<String>) -> Result<()> {
    let event = PushEvent::from_json(&read_input(payload)?)?;
    let mut batch = event.into_batch(context.config())?;
    if let Some(token) = token {
        let credential = Credential::new(token).context("--token must not be empty")?;
        batch = batch.with_credential(credential);
    }

    let orchestrator = BuildOrchestrator::from_context(context)?;
    info!(commits = batch.len(), "starting foreground build");
    let summary = orchestrator.run_batch(batch).await;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.state == BatchState::Aborted {
        bail!("batch {} aborted: build environment unavailable", summary.batch_id);
    }
    if !summary.failed().is_empty() {
        bail!("{} commit(s) failed", summary.failed().len());
    }
    Ok(())
}

fn cmd_resolve(context: &Context, reference: &str, file: Option<String>) -> Result<()> {
    let store = ArtifactStore::new(&context.config().save_directory);
    match store.resolve(reference)? {
        Resolution::Found {
            commit_id,
            path,
            redirect,
        } => {
            if redirect {
                eprintln!("{} -> {}", reference, commit_id);
            }
            match file {
                Some(rel) => match store.file_path(&path, &rel) {
                    Some(file) => println!("{}", file.display()),
                    None => bail!("{} not found in artifact {}", rel, commit_id),
                },
                None => println!("{}", path.display()),
            }
            Ok(())
        }
        Resolution::NotFound => bail!("no artifact matches {:?}", reference),
        Resolution::Ambiguous(candidates) => {
            for id in &candidates {
                eprintln!("  {}", id);
            }
            bail!("{:?} is ambiguous ({} candidates)", reference, candidates.len())
        }
    }
}

fn cmd_list(context: &Context, as_json: bool) -> Result<()> {
    let store = ArtifactStore::new(&context.config().save_directory);
    let entries = store.list()?;
    let head = store.head()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No artifacts published yet.");
        return Ok(());
    }
    for entry in entries {
        let marker = if head.as_ref() == Some(&entry.commit_id) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {}  {}{}",
            marker,
            entry.commit_id,
            entry.published_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if entry.has_log { "" } else { "  (no build log)" }
        );
    }
    Ok(())
}

fn cmd_head(context: &Context) -> Result<()> {
    let store = ArtifactStore::new(&context.config().save_directory);
    match store.head()? {
        Some(id) => println!("{}", id),
        None => println!("(unset)"),
    }
    Ok(())
}

fn provisioner(context: &Context) -> CommandProvisioner {
    CommandProvisioner::new(context.config().provisioner_config())
}

fn cmd_env_status(context: &Context) -> Result<()> {
    let provisioner = provisioner(context);
    println!(
        "{}: {}",
        provisioner.root().display(),
        serde_json::to_string(&provisioner.state())?.trim_matches('"')
    );
    Ok(())
}

async fn cmd_env_ensure(context: &Context, recreate: bool) -> Result<()> {
    let env = provisioner(context)
        .ensure(recreate)
        .await
        .context("Failed to construct build environment")?;
    println!("Environment ready at {}", env.root().display());
    Ok(())
}

fn cmd_token_set(context: &Context, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => read_input(Path::new("-"))?,
    };
    context.store_credential(token.trim())?;
    println!("Token stored in {}", context.config().token_file().display());
    Ok(())
}

fn cmd_token_refresh(context: &Context) -> Result<()> {
    match context.refresh_credential()? {
        Some(_) => println!("Token loaded."),
        None => println!("No token configured; archives are fetched anonymously."),
    }
    Ok(())
}
