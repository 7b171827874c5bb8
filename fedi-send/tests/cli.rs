//! Integration tests for fedi-send

use assert_cmd::Command;
use libfedisend::{Journal, Request, SqliteJournal, StringValues};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

fn setup_test_env() -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let journal_path = temp_dir.path().join("journal.db");

    let config_content = format!(
        r#"
[instance]
base_uri = "http://127.0.0.1:9"

[journal]
path = "{}"

[requester]
max_retries = 0
request_timeout_secs = 2

[credentials]
storage = "memory"
"#,
        escape_path_for_toml(&journal_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (
        temp_dir,
        config_path.to_string_lossy().to_string(),
        journal_path.to_string_lossy().to_string(),
    )
}

fn fedi_send(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("fedi-send").unwrap();
    cmd.env("FEDISEND_CONFIG", config_path)
        .env_remove("FEDISEND_JOURNAL_PATH");
    cmd
}

#[test]
fn test_help() {
    Command::cargo_bin("fedi-send")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("EXIT CODES"));
}

#[test]
fn test_invalid_method() {
    let (_temp_dir, config_path, _journal_path) = setup_test_env();

    fedi_send(&config_path)
        .args(["patch", "/api/v1/statuses/1"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid method 'patch'"));
}

#[test]
fn test_malformed_parameter() {
    let (_temp_dir, config_path, _journal_path) = setup_test_env();

    fedi_send(&config_path)
        .args(["post", "/api/v1/statuses", "-p", "status"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Expected KEY=VALUE"));
}

#[test]
fn test_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[instance]\nbase_uri = \"ftp://example\"\n").unwrap();

    fedi_send(&config_path.to_string_lossy())
        .args(["get", "/api/v1/instance"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("base_uri"));
}

#[tokio::test]
async fn test_unauthenticated_post_stays_journaled() {
    let (_temp_dir, config_path, journal_path) = setup_test_env();

    fedi_send(&config_path)
        .args(["post", "/api/v1/statuses", "-p", "status=Hello"])
        .assert()
        .code(2);

    let journal = SqliteJournal::new(&journal_path).await.unwrap();
    let pending = journal.list().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].route(), "/api/v1/statuses");
    let parameters = StringValues::decode(pending[0].parameters()).unwrap();
    assert_eq!(parameters.get("status"), Some("Hello"));
}

#[tokio::test]
async fn test_unauthenticated_get_is_not_journaled() {
    let (_temp_dir, config_path, journal_path) = setup_test_env();

    fedi_send(&config_path)
        .args(["get", "/api/v1/timelines/home", "--no-resume"])
        .assert()
        .code(2);

    let journal = SqliteJournal::new(&journal_path).await.unwrap();
    assert!(journal.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mutation_queues_behind_stuck_replay() {
    let (_temp_dir, config_path, journal_path) = setup_test_env();
    let journal = SqliteJournal::new(&journal_path).await.unwrap();
    let older = Request::new("POST", "/api/v1/statuses/1/favourite", "{}", "{}", "[]", 1).unwrap();
    journal.put(&older).await.unwrap();

    fedi_send(&config_path)
        .args(["post", "/api/v1/statuses/1/unfavourite"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Queued request"));

    let pending = journal.list().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id(), older.id());
    assert_eq!(pending[1].route(), "/api/v1/statuses/1/unfavourite");
}
