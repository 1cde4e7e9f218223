//! Tracing setup for `docwright` and `docwrightd`.
//!
//! Filtering is resolved in this order: `DOCWRIGHT_LOG`, then `RUST_LOG`,
//! then [`default_directives`] for the level picked on the command line.
//! Logs always go to stderr; stdout belongs to command output
//! (`docwright list`, the batch summary of `docwright build`).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides the log filter for docwright only.
pub const LOG_ENV: &str = "DOCWRIGHT_LOG";

/// HTTP and TLS internals are noisy at debug level; keep them at `warn`
/// unless asked for explicitly.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Filter used when neither [`LOG_ENV`] nor `RUST_LOG` is set: docwright's
/// own crates at `level`, HTTP plumbing at `warn`.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec![
        level.clone(),
        format!("docwright_core={level}"),
        format!("env_provisioner={level}"),
    ];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{t}=warn")));
    directives.join(",")
}

fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. With `json`, every event (including the
/// `obs` lifecycle events) is one JSON line. Safe to call more than once;
/// only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter(level));

    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing already initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_http_stack() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.starts_with("debug,docwright_core=debug,env_provisioner=debug"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.contains("hyper=warn"));
        // Every directive must parse.
        EnvFilter::try_new(&directives).unwrap();
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
