use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("phasic").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Phasic - two-phase policy optimization in Rust",
        ));
}

#[test]
fn test_cli_config_defaults() {
    let mut cmd = Command::cargo_bin("phasic").unwrap();
    cmd.arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"aux_epochs\": 16"))
        .stdout(predicate::str::contains("\"num_env_slots\": 1024"));
}

#[test]
fn test_cli_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"aux_epochs": 3}}"#).unwrap();

    let mut cmd = Command::cargo_bin("phasic").unwrap();
    cmd.arg("config")
        .arg("--config")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"aux_epochs\": 3"));
}

#[test]
fn test_cli_train_short_run() {
    let mut cmd = Command::cargo_bin("phasic").unwrap();
    cmd.arg("train")
        .arg("--iterations")
        .arg("1")
        .arg("--batch-size")
        .arg("64")
        .arg("--sgd-minibatch-size")
        .arg("32")
        .arg("--num-env-slots")
        .arg("32")
        .arg("--aux-minibatch-size")
        .arg("32")
        .arg("--aux-epochs")
        .arg("1")
        .assert()
        .success()
        .stdout(predicate::str::contains("default_policy"))
        .stdout(predicate::str::contains("aux_loss"));
}

#[test]
fn test_cli_train_rejects_short_segments() {
    let mut cmd = Command::cargo_bin("phasic").unwrap();
    cmd.arg("train")
        .arg("--iterations")
        .arg("1")
        .arg("--batch-size")
        .arg("64")
        .arg("--sgd-minibatch-size")
        .arg("32")
        .arg("--num-env-slots")
        .arg("48")
        .assert()
        .failure()
        .stderr(predicate::str::contains("num_env_slots"));
}
