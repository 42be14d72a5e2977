//! End-to-end tests for the `sparq` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn sparq(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sparq").unwrap();
    cmd.env_remove("SPARQ_CONFIG")
        .env_remove("SPARQ_DATA_DIR")
        .arg("--data-dir")
        .arg(dir.path());
    cmd
}

#[test]
fn test_status_creates_store() {
    let dir = TempDir::new().unwrap();

    sparq(&dir)
        .args(["--format", "json", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"schema_version\""))
        .stdout(predicate::str::contains("\"first_time\": true"));

    assert!(dir.path().join("meta.db").exists());
    // Closed cleanly
    assert!(!dir.path().join(".meta.isrunning").exists());
}

#[test]
fn test_query_and_union() {
    let dir = TempDir::new().unwrap();

    sparq(&dir)
        .args(["query", "CREATE TABLE Items (id INTEGER, label TEXT)"])
        .assert()
        .success();
    sparq(&dir)
        .args(["query", "INSERT INTO Items VALUES (1, 'alpha') RETURNING id"])
        .assert()
        .success();

    sparq(&dir)
        .args(["--format", "json", "union", "Items"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"label\": \"alpha\""))
        .stdout(predicate::str::contains("\"graph\": 0"));
}

#[test]
fn test_read_only_missing_store_fails() {
    let dir = TempDir::new().unwrap();

    sparq(&dir)
        .args(["--read-only", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open store"));
}

#[test]
fn test_maintenance_commands() {
    let dir = TempDir::new().unwrap();

    sparq(&dir).arg("checkpoint").assert().success();
    sparq(&dir)
        .args(["vacuum", "--threshold", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Vacuumed"));
    sparq(&dir)
        .arg("vacuum")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to do"));
    sparq(&dir)
        .args(["--format", "json", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"locale_matches\": true"));
}
