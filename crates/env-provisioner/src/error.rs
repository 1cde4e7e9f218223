//! Error types for env-provisioner

use thiserror::Error;

/// Errors that can occur while provisioning a build environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// No construction command configured
    #[error("Environment create command is empty")]
    EmptyCommand,

    /// The construction command could not be started
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The construction command ran and exited unsuccessfully
    #[error("Environment construction `{command}` failed ({status}):\n{output}")]
    ConstructionFailed {
        command: String,
        status: String,
        output: String,
    },

    /// The construction command did not finish in time
    #[error("Environment construction `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
