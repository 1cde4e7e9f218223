//! Command executor against small shell recipes.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use docwright_core::{
    BuildConfig, BuildExecutor, BuildFailureKind, CommandExecutor, Environment, BUILD_LOG_FILE,
};

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn recipe(install: &str, build: &str, cleanup: &str) -> BuildConfig {
    BuildConfig {
        install: vec![sh(install)],
        build: vec![sh(build)],
        cleanup: vec![sh(cleanup)],
        output_dir: PathBuf::from("out/html"),
        timeout_secs: 30,
    }
}

fn workspace() -> (tempfile::TempDir, PathBuf, Environment) {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    let env_root = dir.path().join("_env");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(env_root.join("bin")).unwrap();
    (dir, source, Environment::new(env_root))
}

const WRITE_OUTPUT: &str = "mkdir -p out/html && echo '<html></html>' > out/html/index.html";

#[tokio::test]
async fn test_successful_build_writes_transcript_into_output() {
    let (_dir, source, env) = workspace();
    let build = format!("{WRITE_OUTPUT} && echo built with marker=$DOCWRIGHT");
    let executor = CommandExecutor::new(recipe(
        "echo installing; echo deprecated >&2",
        &build,
        "echo uninstalling",
    ));

    let staged = executor.build(&source, &env).await.unwrap();

    assert_eq!(staged.output_dir, source.join("out/html"));
    assert_eq!(staged.transcript.entries().len(), 3);
    let log = std::fs::read_to_string(staged.output_dir.join(BUILD_LOG_FILE)).unwrap();
    assert!(log.starts_with("$ sh -c 'echo installing"));
    assert!(log.contains("deprecated"));
    assert!(log.contains("built with marker=1"));
    assert!(log.contains("uninstalling"));
}

#[tokio::test]
async fn test_install_failure_skips_build_but_still_cleans_up() {
    let (_dir, source, env) = workspace();
    let executor = CommandExecutor::new(recipe(
        "echo cannot resolve Sphinx; exit 3",
        WRITE_OUTPUT,
        "echo uninstalling",
    ));

    let failure = executor.build(&source, &env).await.unwrap_err();

    assert!(matches!(failure.kind, BuildFailureKind::StepFailed { .. }));
    assert!(failure.to_string().contains('3'));
    assert!(!source.join("out").exists());
    let commands: Vec<_> = failure
        .transcript
        .entries()
        .iter()
        .map(|e| e.exit_code)
        .collect();
    assert_eq!(commands, vec![Some(3), Some(0)]);
    assert!(failure.detail().contains("cannot resolve Sphinx"));
}

#[tokio::test]
async fn test_stdout_and_stderr_are_merged_in_arrival_order() {
    let (_dir, source, env) = workspace();
    let executor = CommandExecutor::new(recipe(
        "true",
        "echo step1; sleep 0.2; echo ERROR-in-step1 >&2; sleep 0.2; echo step2; exit 1",
        "true",
    ));

    let failure = executor.build(&source, &env).await.unwrap_err();

    let build_step = &failure.transcript.entries()[1];
    assert_eq!(build_step.exit_code, Some(1));
    assert_eq!(build_step.output, "step1\nERROR-in-step1\nstep2\n");
}

#[tokio::test]
async fn test_cleanup_failure_is_not_fatal() {
    let (_dir, source, env) = workspace();
    let executor = CommandExecutor::new(recipe("true", WRITE_OUTPUT, "exit 1"));
    let staged = executor.build(&source, &env).await.unwrap();
    assert!(staged.output_dir.join("index.html").is_file());
}

#[tokio::test]
async fn test_missing_output_directory_fails() {
    let (_dir, source, env) = workspace();
    let executor = CommandExecutor::new(recipe("true", "echo forgot to write", "true"));
    let failure = executor.build(&source, &env).await.unwrap_err();
    assert!(matches!(failure.kind, BuildFailureKind::MissingOutput(_)));
    assert!(failure.detail().contains("forgot to write"));
}

#[tokio::test]
async fn test_steps_see_the_environment() {
    let (_dir, source, env) = workspace();
    let build = format!(
        "{WRITE_OUTPUT} && echo venv=$VIRTUAL_ENV && echo first=$(echo $PATH | cut -d: -f1) \
         && echo src={{source}}"
    );
    let executor = CommandExecutor::new(recipe("true", &build, "true"));

    let staged = executor.build(&source, &env).await.unwrap();
    let output = &staged.transcript.entries()[1].output;
    assert!(output.contains(&format!("venv={}", env.root().display())));
    assert!(output.contains(&format!("first={}", env.bin_dir().display())));
    assert!(output.contains(&format!("src={}", source.display())));
}

#[tokio::test]
async fn test_step_timeout() {
    let (_dir, source, env) = workspace();
    let mut config = recipe("true", "sleep 5", "true");
    config.timeout_secs = 1;
    let failure = CommandExecutor::new(config)
        .build(&source, &env)
        .await
        .unwrap_err();
    assert!(matches!(failure.kind, BuildFailureKind::Timeout { timeout_secs: 1, .. }));
}

#[tokio::test]
async fn test_unknown_program_is_spawn_failure() {
    let (_dir, source, env) = workspace();
    let config = BuildConfig {
        install: Vec::new(),
        build: vec![vec!["docwright-no-such-program".to_string()]],
        cleanup: Vec::new(),
        output_dir: PathBuf::from("out"),
        timeout_secs: 5,
    };
    let failure = CommandExecutor::new(config)
        .build(Path::new(&source), &env)
        .await
        .unwrap_err();
    assert!(matches!(failure.kind, BuildFailureKind::Spawn { .. }));
}
