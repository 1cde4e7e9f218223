//! TOML configuration and the on-disk layout it implies.
//!
//! ```toml
//! repository = "acme/widgets"
//! save_directory = "/var/lib/docwright"
//! docs_base_url = "https://docs.example.com"
//!
//! [fetch]
//! concurrency = 4
//!
//! [build]
//! build = [["{python}", "setup.py", "build_sphinx"]]
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use env_provisioner::ProvisionerConfig;
use serde::{Deserialize, Serialize};

use crate::domain::{CommitId, DocwrightError, Result};

/// Reserved directory for the cached build environment.
pub const ENV_DIR: &str = "_env";
/// Reserved directory for archives, extracted trees and staging output.
pub const WORK_DIR: &str = "_work";
/// Head pointer file.
pub const HEAD_FILE: &str = "head.txt";
/// Persisted access token.
pub const TOKEN_FILE: &str = "token.txt";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tracked repository as `owner/name`.
    pub repository: String,
    /// Root of the artifact store.
    pub save_directory: PathBuf,
    /// Base URL of the snapshot source API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Public URL under which artifacts are served; used for permalinks.
    #[serde(default)]
    pub docs_base_url: Option<String>,
    /// Access token. When absent, `token.txt` in the save directory is used.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Rebuild the environment at the start of every batch.
    #[serde(default)]
    pub recreate_environment: bool,
    /// Endpoint that receives a JSON report for every finished commit.
    #[serde(default)]
    pub complete_hook_url: Option<String>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

/// Snapshot download settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Maximum downloads in flight.
    pub concurrency: usize,
    /// Maximum redirect hops followed per download.
    pub max_redirects: usize,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_redirects: 10,
            timeout_secs: 300,
        }
    }
}

/// Build environment settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Construction argv template; `{env}` is the environment root.
    pub create_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            create_command: ["python3", "-m", "venv", "{env}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 600,
        }
    }
}

/// Build recipe: argv templates run from the source tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Dependency installation steps.
    pub install: Vec<Vec<String>>,
    /// Documentation toolchain steps.
    pub build: Vec<Vec<String>>,
    /// Steps that undo `install`; always attempted, failures only logged.
    pub cleanup: Vec<Vec<String>>,
    /// Generated output, relative to the source tree.
    pub output_dir: PathBuf,
    /// Upper bound for each step.
    pub timeout_secs: u64,
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            install: vec![
                argv(&["{python}", "setup.py", "develop", "--upgrade"]),
                argv(&["{python}", "-m", "pip", "install", "Sphinx"]),
            ],
            build: vec![argv(&["{python}", "setup.py", "build_sphinx"])],
            cleanup: vec![argv(&["{python}", "setup.py", "develop", "--uninstall"])],
            output_dir: PathBuf::from("build/sphinx/html"),
            timeout_secs: 1800,
        }
    }
}

impl BuildConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Config with every optional setting at its default.
    pub fn new(repository: impl Into<String>, save_directory: impl Into<PathBuf>) -> Self {
        Config {
            repository: repository.into(),
            save_directory: save_directory.into(),
            api_base: default_api_base(),
            docs_base_url: None,
            access_token: None,
            recreate_environment: false,
            complete_hook_url: None,
            fetch: FetchConfig::default(),
            environment: EnvironmentConfig::default(),
            build: BuildConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DocwrightError::Config(msg));

        let valid_repository = matches!(
            self.repository.split_once('/'),
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/')
        );
        if !valid_repository {
            return invalid(format!(
                "repository must be owner/name, got {:?}",
                self.repository
            ));
        }
        if self.save_directory.as_os_str().is_empty() {
            return invalid("save_directory must be set".to_string());
        }
        if self.fetch.concurrency == 0 {
            return invalid("fetch.concurrency must be at least 1".to_string());
        }
        if self.fetch.timeout_secs == 0
            || self.environment.timeout_secs == 0
            || self.build.timeout_secs == 0
        {
            return invalid("timeouts must be greater than zero".to_string());
        }
        if self.environment.create_command.is_empty() {
            return invalid("environment.create_command must not be empty".to_string());
        }
        if self.build.build.is_empty() {
            return invalid("build.build needs at least one step".to_string());
        }
        let mut steps = self
            .build
            .install
            .iter()
            .chain(&self.build.build)
            .chain(&self.build.cleanup);
        if steps.any(|step| step.is_empty()) {
            return invalid("build steps must not be empty".to_string());
        }
        let escapes = self
            .build
            .output_dir
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || self.build.output_dir.as_os_str().is_empty() {
            return invalid(format!(
                "build.output_dir must be a relative path inside the source tree, got {}",
                self.build.output_dir.display()
            ));
        }
        Ok(())
    }

    pub fn env_dir(&self) -> PathBuf {
        self.save_directory.join(ENV_DIR)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.save_directory.join(WORK_DIR)
    }

    pub fn head_file(&self) -> PathBuf {
        self.save_directory.join(HEAD_FILE)
    }

    pub fn token_file(&self) -> PathBuf {
        self.save_directory.join(TOKEN_FILE)
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            root: self.env_dir(),
            create_command: self.environment.create_command.clone(),
            timeout: Duration::from_secs(self.environment.timeout_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    /// Canonical URL of a commit's published docs.
    pub fn permalink(&self, id: &CommitId) -> String {
        match &self.docs_base_url {
            Some(base) => format!("{}/{}/", base.trim_end_matches('/'), id),
            None => format!("https://github.com/{}/commit/{}", self.repository, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
repository = "acme/widgets"
save_directory = "/var/lib/docwright"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.api_base, "https://api.github.com");
        assert_eq!(config.fetch, FetchConfig::default());
        assert_eq!(config.fetch.max_redirects, 10);
        assert_eq!(config.build.output_dir, PathBuf::from("build/sphinx/html"));
        assert!(!config.recreate_environment);
        assert_eq!(config.env_dir(), PathBuf::from("/var/lib/docwright/_env"));
        assert_eq!(config.head_file(), PathBuf::from("/var/lib/docwright/head.txt"));
    }

    #[test]
    fn test_full_config_parses() {
        let text = r#"
repository = "acme/widgets"
save_directory = "/srv/docs"
docs_base_url = "https://docs.acme.dev/"
recreate_environment = true
complete_hook_url = "https://hooks.acme.dev/docs"

[fetch]
concurrency = 8
max_redirects = 3

[environment]
create_command = ["virtualenv", "{env}"]

[build]
install = [["{bin}/pip", "install", "-e", "."]]
build = [["{bin}/sphinx-build", "docs", "out"]]
cleanup = []
output_dir = "out"
timeout_secs = 60
"#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.fetch.concurrency, 8);
        assert_eq!(config.fetch.timeout_secs, 300);
        assert_eq!(config.environment.create_command[0], "virtualenv");
        assert!(config.build.cleanup.is_empty());
        assert_eq!(config.build.step_timeout(), Duration::from_secs(60));
        assert!(config.recreate_environment);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = format!("{MINIMAL}\nsave_dir = \"/tmp\"\n");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(DocwrightError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::new("no-slash", "/srv");
        assert!(config.validate().is_err());

        config.repository = "a/b".to_string();
        assert!(config.validate().is_ok());

        config.fetch.concurrency = 0;
        assert!(config.validate().is_err());
        config.fetch.concurrency = 1;

        config.build.output_dir = PathBuf::from("../escape");
        assert!(config.validate().is_err());
        config.build.output_dir = PathBuf::from("/abs");
        assert!(config.validate().is_err());
        config.build.output_dir = PathBuf::from("html");

        config.build.build = vec![];
        assert!(config.validate().is_err());
        config.build.build = vec![vec![]];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_permalink() {
        let id = CommitId::parse(&"a".repeat(40)).unwrap();
        let mut config = Config::new("acme/widgets", "/srv");
        assert_eq!(
            config.permalink(&id),
            format!("https://github.com/acme/widgets/commit/{}", id)
        );

        config.docs_base_url = Some("https://docs.acme.dev/".to_string());
        assert_eq!(config.permalink(&id), format!("https://docs.acme.dev/{}/", id));
    }
}
