use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn config_hash_prints_stable_hash_for_shipped_defaults() {
    let base = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/defaults/base.yaml")
        .to_string_lossy()
        .to_string();

    let first = Command::cargo_bin("velo")
        .unwrap()
        .args(["config-hash", &base])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^config_hash=[0-9a-f]{64}\n").unwrap())
        .get_output()
        .stdout
        .clone();

    let second = Command::cargo_bin("velo")
        .unwrap()
        .args(["config-hash", &base])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    assert_eq!(first, second);
}

#[test]
fn later_layer_changes_the_hash() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_yaml(&dir, "base.yaml", "poller:\n  interval_secs: 60\n");
    let over = write_yaml(&dir, "over.yaml", "poller:\n  interval_secs: 30\n");

    let only_base = Command::cargo_bin("velo")
        .unwrap()
        .args(["config-hash", &base])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let layered = Command::cargo_bin("velo")
        .unwrap()
        .args(["config-hash", &base, &over])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"interval_secs\":30"))
        .get_output()
        .stdout
        .clone();

    assert_ne!(only_base, layered);
}

#[test]
fn secret_literal_in_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_yaml(
        &dir,
        "bad.yaml",
        "database:\n  url_env: \"postgres://velo:hunter2@db/velo\"\n",
    );

    Command::cargo_bin("velo")
        .unwrap()
        .args(["config-hash", &bad])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("hunter2").not());
}

#[test]
fn poll_once_requires_config() {
    Command::cargo_bin("velo")
        .unwrap()
        .args(["poll", "once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn oversized_retention_override_is_rejected_before_connecting() {
    Command::cargo_bin("velo")
        .unwrap()
        .env_remove("VELO_DATABASE_URL")
        .args([
            "log",
            "prune",
            "--config",
            "does-not-matter.yaml",
            "--retention-hours",
            "18446744073709551615",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("RETENTION_INVALID"));
}
