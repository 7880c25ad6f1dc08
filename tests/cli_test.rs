// Binary-level checks for the operator CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const SINGLE_PHASE: &str = r#"
[store]
url = "memory"

[dispatch]
credentials = "none"

[observability]
log_level = "warn"
json_logs = false

[[phases]]
name = "phase5"
expected_processors = ["grader", "publisher"]
max_wait_secs = 3600

[phases.aliases]
PredictionGrader = "grader"
"#;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("orchestrator.toml");
    fs::write(&path, contents).unwrap();
    path
}

fn orchestrator(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("phase-orchestrator").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

#[test]
fn help_lists_operator_commands() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("handle"))
        .stdout(predicate::str::contains("sweep"))
        .stdout(predicate::str::contains("reset-health"));
}

#[test]
fn config_prints_effective_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SINGLE_PHASE);

    orchestrator(&dir)
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("name = \"phase5\""))
        .stdout(predicate::str::contains("max_heal_attempts = 3"));
}

#[test]
fn environment_overrides_file_values() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SINGLE_PHASE);

    orchestrator(&dir)
        .env("PHASE_ORCHESTRATOR__RECONCILER__MAX_HEAL_ATTEMPTS", "7")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_heal_attempts = 7"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[[phases]]
name = "phase2"
expected_processors = []
max_wait_secs = 60
"#,
    );

    orchestrator(&dir)
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no expected_processors"));
}

#[test]
fn handle_reads_event_from_stdin() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SINGLE_PHASE);

    orchestrator(&dir)
        .arg("--config")
        .arg(&path)
        .arg("--json")
        .args(["handle", "--phase", "phase5"])
        .write_stdin(
            r#"{"partition_key":"2024-03-01","processor_name":"PredictionGrader","status":"success"}"#,
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("\"decision\": \"waiting\""))
        .stdout(predicate::str::contains("\"partition_key\": \"2024-03-01\""));
}

#[test]
fn handle_rejects_malformed_event() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SINGLE_PHASE);

    orchestrator(&dir)
        .arg("--config")
        .arg(&path)
        .args(["handle", "--phase", "phase5"])
        .write_stdin("not json")
        .assert()
        .failure();
}

#[test]
fn unknown_phase_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SINGLE_PHASE);

    orchestrator(&dir)
        .arg("--config")
        .arg(&path)
        .args(["handle", "--phase", "phase9"])
        .write_stdin(r#"{"partition_key":"k","processor_name":"grader","status":"success"}"#)
        .assert()
        .failure()
        .stderr(predicate::str::contains("phase9"));
}
