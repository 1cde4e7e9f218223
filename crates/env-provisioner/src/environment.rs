//! Environment handle and argv templating
//!
//! An [`Environment`] is nothing more than a private directory holding an
//! interpreter/toolchain install. Commands that run "inside" it are written
//! as argv templates with placeholders that this module expands.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Handle to a provisioned build environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    root: PathBuf,
}

impl Environment {
    /// Wrap an environment rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Environment { root: root.into() }
    }

    /// Root directory of the environment
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the environment's executables
    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    /// The environment's interpreter
    pub fn python(&self) -> PathBuf {
        if cfg!(windows) {
            self.bin_dir().join("python.exe")
        } else {
            self.bin_dir().join("python")
        }
    }

    /// Expand an argv template.
    ///
    /// Recognised placeholders: `{env}`, `{bin}`, `{python}` and, when a
    /// source tree is given, `{source}`.
    pub fn expand(&self, template: &[String], source: Option<&Path>) -> Vec<String> {
        let env = self.root.to_string_lossy();
        let bin = self.bin_dir();
        let bin = bin.to_string_lossy();
        let python = self.python();
        let python = python.to_string_lossy();

        template
            .iter()
            .map(|arg| {
                let mut arg = arg
                    .replace("{python}", &python)
                    .replace("{bin}", &bin)
                    .replace("{env}", &env);
                if let Some(source) = source {
                    arg = arg.replace("{source}", &source.to_string_lossy());
                }
                arg
            })
            .collect()
    }
}

/// Render an argv as a single shell-like line for logs and transcripts
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let needs_quotes = arg.is_empty()
                || arg
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '$' | '\\'));
            if needs_quotes {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_placeholders() {
        let env = Environment::new("/srv/docs/_env");
        let expanded = env.expand(
            &argv(&["{python}", "setup.py", "--prefix={env}", "{bin}/pip"]),
            None,
        );

        assert_eq!(expanded[0], env.python().to_string_lossy());
        assert_eq!(expanded[1], "setup.py");
        assert_eq!(expanded[2], "--prefix=/srv/docs/_env");
        assert!(expanded[3].ends_with("/pip"));
    }

    #[test]
    fn test_expand_source_only_when_given() {
        let env = Environment::new("/e");
        let template = argv(&["cd", "{source}"]);

        let without = env.expand(&template, None);
        assert_eq!(without[1], "{source}");

        let with = env.expand(&template, Some(Path::new("/work/tree")));
        assert_eq!(with[1], "/work/tree");
    }

    #[cfg(unix)]
    #[test]
    fn test_bin_dir_unix() {
        let env = Environment::new("/e");
        assert_eq!(env.bin_dir(), PathBuf::from("/e/bin"));
        assert_eq!(env.python(), PathBuf::from("/e/bin/python"));
    }

    #[test]
    fn test_render_command_quotes_when_needed() {
        assert_eq!(
            render_command(&argv(&["sh", "-c", "echo hi"])),
            "sh -c 'echo hi'"
        );
        assert_eq!(render_command(&argv(&["ls", ""])), "ls ''");
        assert_eq!(render_command(&argv(&["echo", "it's"])), r"echo 'it'\''s'");
    }
}
