// CLI surface checks for the remote-runs binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("remote-runs").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("workspaces"));
}

#[test]
fn test_apply_help_shows_run_flags() {
    let mut cmd = Command::cargo_bin("remote-runs").unwrap();

    cmd.args(["apply", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--auto-approve"))
        .stdout(predicate::str::contains("--destroy"))
        .stdout(predicate::str::contains("--workspace"))
        .stdout(predicate::str::contains("--dir"))
        .stdout(predicate::str::contains("--apply-if-no-changes"));
}

#[test]
fn test_missing_subcommand_is_usage_error() {
    let mut cmd = Command::cargo_bin("remote-runs").unwrap();

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_plan_without_organization_explains_local_mode() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.tf"), "resource \"null_resource\" \"a\" {}\n").unwrap();

    let mut cmd = Command::cargo_bin("remote-runs").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("REMOTE_RUNS_BACKEND__ORGANIZATION")
        .env("RUST_LOG", "off")
        .args(["plan", "--dir", "."])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no organization is configured"));
}
