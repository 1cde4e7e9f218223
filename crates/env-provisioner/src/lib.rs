//! Env-Provisioner: cached build environments for docwright
//!
//! A build environment is an interpreter/toolchain install rooted in a
//! private directory. It is created on first use, reused across builds,
//! and destroyed and rebuilt wholesale when the caller asks for it. It is
//! never partially repaired.

pub mod environment;
pub mod error;
pub mod provisioner;

pub use environment::{render_command, Environment};
pub use error::EnvError;
pub use provisioner::{
    CommandProvisioner, EnvironmentProvisioner, EnvironmentState, ProvisionerConfig, READY_MARKER,
};

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, EnvError>;
