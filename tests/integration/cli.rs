//! The `conductor` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::support::init_repo;

const THREE_GOALS: &str = r#"{
    "goals": [
        { "id": "G1", "title": "Parser", "declared_paths": ["a.txt"] },
        { "id": "G2", "title": "Lexer", "declared_paths": ["b.txt"] },
        { "id": "G3", "title": "Wire up", "declared_paths": ["a.txt"], "requires": ["G1"] }
    ]
}"#;

#[allow(deprecated)]
fn conductor_cmd() -> Command {
    Command::cargo_bin("conductor").expect("Failed to find conductor binary")
}

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

// ============================================================================
// Planning
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    conductor_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_dry_run_prints_schedule() {
    let temp_dir = TempDir::new().expect("temp dir");
    let goals = write(temp_dir.path(), "goals.json", THREE_GOALS);

    conductor_cmd()
        .args(["--no-color", "--root"])
        .arg(temp_dir.path())
        .args(["run", "--dry-run"])
        .arg(&goals)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 goals in 2 waves"))
        .stdout(predicate::str::contains("Wave 1"))
        .stdout(predicate::str::contains("G3 Wire up (requires G1)"));
}

#[test]
fn test_cycle_exits_with_fatal_code() {
    let temp_dir = TempDir::new().expect("temp dir");
    let goals = write(
        temp_dir.path(),
        "goals.toml",
        r#"
[[goals]]
id = "A"
requires = ["B"]

[[goals]]
id = "B"
requires = ["A"]
"#,
    );

    conductor_cmd()
        .arg("--root")
        .arg(temp_dir.path())
        .args(["run", "--dry-run"])
        .arg(&goals)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_missing_goals_file_exits_with_fatal_code() {
    let temp_dir = TempDir::new().expect("temp dir");

    conductor_cmd()
        .arg("--root")
        .arg(temp_dir.path())
        .args(["run", "missing.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.json"));
}

// ============================================================================
// Running
// ============================================================================

#[test]
fn test_run_without_agent_exits_with_fatal_code() {
    let repo = TempDir::new().expect("temp dir");
    init_repo(repo.path());
    let fixtures = TempDir::new().expect("temp dir");
    let goals = write(fixtures.path(), "goals.json", THREE_GOALS);

    conductor_cmd()
        .arg("--root")
        .arg(repo.path())
        .arg("run")
        .arg(&goals)
        .env_remove("RALPH_CONDUCTOR__AGENT__COMMAND")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no agent command configured"));
}

#[test]
fn test_run_then_status_json() {
    let repo = TempDir::new().expect("temp dir");
    init_repo(repo.path());
    let fixtures = TempDir::new().expect("temp dir");
    let goals = write(
        fixtures.path(),
        "goals.json",
        r#"[{ "id": "build", "title": "Write output", "declared_paths": ["out.txt"] }]"#,
    );
    let config = write(
        fixtures.path(),
        "conductor.toml",
        r#"
[agent]
command = "sh"
args = ["-c", "echo built > out.txt"]

[git]
base_branch = "main"

[workers]
max_memory_mb_per_worker = 0
"#,
    );

    conductor_cmd()
        .args(["--no-color", "--root"])
        .arg(repo.path())
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&goals)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 of 1 goals merged"));

    assert_eq!(
        fs::read_to_string(repo.path().join("out.txt")).expect("out"),
        "built\n"
    );

    let output = conductor_cmd()
        .arg("--root")
        .arg(repo.path())
        .args(["status", "--json"])
        .output()
        .expect("status");
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(status["phase"], "completed");
    assert_eq!(status["goals"][0]["goal_id"], "build");
    assert_eq!(status["goals"][0]["status"], "merged");
    assert_eq!(status["locks"].as_array().map(Vec::len), Some(0));
}

#[test]
fn test_failing_agent_exits_with_code_one() {
    let repo = TempDir::new().expect("temp dir");
    init_repo(repo.path());
    let fixtures = TempDir::new().expect("temp dir");
    let goals = write(
        fixtures.path(),
        "goals.json",
        r#"[{ "id": "broken", "title": "Fails" }, { "id": "after", "requires": ["broken"] }]"#,
    );
    let config = write(
        fixtures.path(),
        "conductor.toml",
        r#"
[agent]
command = "sh"
args = ["-c", "echo nope >&2; exit 3"]

[workers]
max_memory_mb_per_worker = 0
"#,
    );

    conductor_cmd()
        .args(["--no-color", "--root"])
        .arg(repo.path())
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&goals)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("0 of 2 goals merged"))
        .stdout(predicate::str::contains("blocked"));
}

// ============================================================================
// Status and control
// ============================================================================

#[test]
fn test_status_without_run() {
    let temp_dir = TempDir::new().expect("temp dir");

    conductor_cmd()
        .arg("--root")
        .arg(temp_dir.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("null\n"));

    conductor_cmd()
        .arg("--root")
        .arg(temp_dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No conductor run recorded"));
}

#[test]
fn test_pause_unknown_worker_exits_with_fatal_code() {
    let temp_dir = TempDir::new().expect("temp dir");

    conductor_cmd()
        .arg("--root")
        .arg(temp_dir.path())
        .args(["pause", "worker-7"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown worker 'worker-7'"));
}
