use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Runs the binary against an isolated state database and config file.
fn simplodon(dir: &Path) -> Command {
    let config = dir.join("config.yaml");
    if !config.exists() {
        fs::write(&config, "ui:\n  thread_wait: 1s\n").expect("write config");
    }
    let mut cmd = Command::cargo_bin("simplodon").expect("simplodon binary");
    cmd.arg("--state")
        .arg(dir.join("state.db"))
        .arg("--config")
        .arg(config)
        .env_remove("SIMPLODON_LOG");
    cmd
}

#[test]
fn without_server_shows_server_form() {
    let dir = tempdir().unwrap();
    simplodon(dir.path())
        .arg("#public")
        .assert()
        .success()
        .stdout(predicate::str::contains("<!DOCTYPE html>"))
        .stdout(predicate::str::contains("id=\"changeserver\""))
        .stdout(predicate::str::contains("(no hostname)"));
}

#[test]
fn settings_persist_server_and_theme() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("page.html");
    simplodon(dir.path())
        .args(["--server", "https://Example.Social/", "--theme", "1", "#settings"])
        .arg("--output")
        .arg(&out)
        .assert()
        .success();
    let page = fs::read_to_string(&out).unwrap();
    assert!(page.contains("<h1>example.social</h1>"));
    let themes = simplodon::config::UIConfig::default().themes;
    assert!(page.contains(&format!(r#"<link rel="stylesheet" href="{}">"#, themes[1])));

    simplodon(dir.path())
        .arg("#settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reading from example.social."));
}

#[test]
fn logout_forgets_server() {
    let dir = tempdir().unwrap();
    simplodon(dir.path())
        .args(["--server", "example.social", "#settings"])
        .assert()
        .success();
    simplodon(dir.path())
        .args(["--logout", "#settings"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No server chosen."));
}

#[test]
fn rejects_bad_input() {
    let dir = tempdir().unwrap();
    simplodon(dir.path())
        .args(["--server", "not a host"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
    simplodon(dir.path())
        .args(["--theme", "99", "#settings"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("theme 99 does not exist"));
    simplodon(dir.path())
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown option --frobnicate"));
}
