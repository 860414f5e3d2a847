//! End-to-end CLI tests for the assetfetch binary.

mod support;

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use support::mock_files::sha1_hex;
use support::socket_guard::start_mock_server_or_skip;

/// Command with an isolated config home so a developer's config is never read.
fn assetfetch(config_home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("assetfetch").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home).env_remove("RUST_LOG");
    cmd
}

fn write_version(dir: &Path, client_url: &str, client: &[u8]) -> std::path::PathBuf {
    let json = format!(
        r#"{{
            "id": "test-1",
            "downloads": {{"client": {{"sha1": "{}", "size": {}, "url": "{client_url}"}}}},
            "libraries": []
        }}"#,
        sha1_hex(client),
        client.len()
    );
    let path = dir.join("test-1.json");
    std::fs::write(&path, json).unwrap();
    path
}

#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    assetfetch(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--game-dir"))
        .stdout(predicate::str::contains("--repair"));
}

#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    assetfetch(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("assetfetch"));
}

#[test]
fn test_binary_requires_input() {
    let home = TempDir::new().unwrap();
    assetfetch(home.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("INPUT"));
}

#[test]
fn test_binary_missing_descriptor_fails() {
    let home = TempDir::new().unwrap();
    assetfetch(home.path())
        .args(["/definitely/not/here.json", "--no-progress"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load version descriptor"));
}

#[test]
fn test_binary_rejects_unknown_source() {
    let home = TempDir::new().unwrap();
    assetfetch(home.path())
        .args(["v.json", "--source", "nowhere", "--no-progress"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot use source 'nowhere'"));
}

#[test]
fn test_binary_rejects_unknown_config_key() {
    let home = TempDir::new().unwrap();
    let config_dir = home.path().join("assetfetch");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), "progress = false\nturbo = true\n").unwrap();

    assetfetch(home.path())
        .args(["v.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'turbo' on line 2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_downloads_version_files() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let client = b"client jar bytes".to_vec();
    Mock::given(method("GET"))
        .and(path("/client.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(client.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let version = write_version(work.path(), &format!("{}/client.jar", server.uri()), &client);
    let game_dir = work.path().join("game");

    let home = work.path().join("home");
    let args = vec![
        version.display().to_string(),
        "--game-dir".into(),
        game_dir.display().to_string(),
        "--source".into(),
        "official".into(),
        "--no-progress".into(),
    ];
    let assert = tokio::task::spawn_blocking(move || assetfetch(&home).args(args).assert())
        .await
        .unwrap();
    assert.success();

    let jar = game_dir.join("versions/test-1/test-1.jar");
    assert_eq!(std::fs::read(jar).unwrap(), client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_exits_non_zero_when_a_file_fails() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/client.jar"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let version = write_version(work.path(), &format!("{}/client.jar", server.uri()), b"x");
    let game_dir = work.path().join("game");

    let home = work.path().join("home");
    let args = vec![
        version.display().to_string(),
        "--game-dir".into(),
        game_dir.display().to_string(),
        "--source".into(),
        "official".into(),
        "--no-progress".into(),
    ];
    let assert = tokio::task::spawn_blocking(move || assetfetch(&home).args(args).assert())
        .await
        .unwrap();
    assert
        .failure()
        .stderr(predicate::str::contains("1 file(s) could not be downloaded"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_repair_refetches_corrupted_client() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let client = b"the real client".to_vec();
    Mock::given(method("GET"))
        .and(path("/client.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(client.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let version = write_version(work.path(), &format!("{}/client.jar", server.uri()), &client);
    let game_dir = work.path().join("game");
    let jar = game_dir.join("versions/test-1/test-1.jar");
    std::fs::create_dir_all(jar.parent().unwrap()).unwrap();
    std::fs::write(&jar, b"garbage!").unwrap();

    let home = work.path().join("home");
    let args = vec![
        version.display().to_string(),
        "--game-dir".into(),
        game_dir.display().to_string(),
        "--source".into(),
        "official".into(),
        "--repair".into(),
        "--no-progress".into(),
    ];
    let assert = tokio::task::spawn_blocking(move || assetfetch(&home).args(args).assert())
        .await
        .unwrap();
    assert.success();

    assert_eq!(std::fs::read(&jar).unwrap(), client);
}
