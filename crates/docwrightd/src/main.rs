//! docwrightd - intake daemon
//!
//! Reads push payloads from stdin, one JSON document per line, and queues
//! each as a batch on a [`BuildService`]. Submission never waits for the
//! build. On EOF (or Ctrl-C) the queue is drained before exiting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

use docwright_core::{
    BuildOrchestrator, BuildService, Config, Context, PushEvent, SubmitError,
    DEFAULT_QUEUE_CAPACITY,
};

#[derive(Parser)]
#[command(name = "docwrightd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Queue documentation builds from push payloads on stdin", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "DOCWRIGHT_CONFIG", default_value = "docwright.toml")]
    config: PathBuf,

    /// Maximum number of batches waiting to run
    #[arg(long, env = "DOCWRIGHT_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    docwright_core::telemetry::init_tracing(args.json, level);

    let context = Context::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let context = Arc::new(context);
    let orchestrator = Arc::new(BuildOrchestrator::from_context(context.clone())?);
    let service = BuildService::spawn(orchestrator, args.queue_capacity);
    info!(capacity = args.queue_capacity, "docwrightd accepting payloads");

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        res = intake(stdin, context.config(), &service) => {
            let accepted = res?;
            info!(accepted, "input closed, draining queue");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, draining queue");
        }
    }

    let completed = service.shutdown().await;
    info!(completed, "docwrightd stopped");
    Ok(())
}

/// Submit every payload line until EOF. Returns how many batches were queued.
async fn intake<R>(reader: R, config: &Config, service: &BuildService) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match queue_payload(line, config, service) {
            Ok(batch_id) => {
                accepted += 1;
                info!(batch_id = %batch_id, "payload queued");
            }
            Err(e) => warn!(error = %e, "payload rejected"),
        }
    }
    Ok(accepted)
}

fn queue_payload(line: &str, config: &Config, service: &BuildService) -> Result<String> {
    let batch = PushEvent::from_json(line)?.into_batch(config)?;
    if batch.is_empty() {
        anyhow::bail!("payload has no commits");
    }
    service.submit(batch).map_err(|e| match e {
        SubmitError::QueueFull { .. } => anyhow::anyhow!("{e}; payload dropped"),
        SubmitError::Closed => anyhow::anyhow!("{e}"),
    })
}
