use std::process::Command;

use eyre::Context as _;
use predicates::prelude::*;

#[test]
fn paths_reports_overridden_dirs_as_json() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("intercom");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("INTERCOM_CONFIG_DIR", cfg_dir.path())
        .env("INTERCOM_DATA_DIR", data_dir.path())
        .arg("paths")
        .output()
        .context("run intercom paths")?;

    assert!(
        out.status.success(),
        "paths exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse paths json")?;
    assert_eq!(
        v.get("data_dir").and_then(serde_json::Value::as_str),
        data_dir.path().to_str()
    );
    assert_eq!(
        v.get("config_dir").and_then(serde_json::Value::as_str),
        cfg_dir.path().to_str()
    );
    assert!(v
        .get("log_file")
        .and_then(|x| x.as_str())
        .is_some_and(|s| s.ends_with("intercom.log.jsonl")));
    Ok(())
}

#[test]
fn unknown_subcommand_is_rejected() {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("intercom"))
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[cfg(unix)]
#[test]
fn wallet_lifecycle_through_auto_spawned_daemon() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("intercom");
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let run = |args: &[&str]| {
        assert_cmd::Command::new(exe)
            .env("INTERCOM_CONFIG_DIR", cfg_dir.path())
            .env("INTERCOM_DATA_DIR", data_dir.path())
            .env("INTERCOM_DAEMON_IDLE_EXIT_SECONDS", "2")
            .env("INTERCOM_PASSWORD", "correct horse")
            .args(args)
            .assert()
    };

    run(&["state"])
        .success()
        .stdout(predicate::str::contains("\"idle\""));
    run(&["init"])
        .success()
        .stdout(predicate::str::contains("\"mnemonic\"").and(predicate::str::contains("\"ready\"")));
    run(&["lock"])
        .success()
        .stdout(predicate::str::contains("\"locked\""));
    run(&["sign", "ed00", "00"]).failure();
    run(&["unlock"])
        .success()
        .stdout(predicate::str::contains("\"ready\""));
    run(&["account", "create", "--name", "Savings"])
        .success()
        .stdout(predicate::str::contains("Savings"));
    Ok(())
}

#[test]
fn import_without_terminal_or_env_fails_before_connecting() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("intercom"))
        .env("INTERCOM_CONFIG_DIR", cfg_dir.path())
        .env("INTERCOM_DATA_DIR", data_dir.path())
        .env_remove("INTERCOM_MNEMONIC")
        .env("INTERCOM_PASSWORD", "pw")
        .args(["init", "--import"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("INTERCOM_MNEMONIC"));

    #[cfg(unix)]
    assert!(!data_dir.path().join("intercom.sock").exists());
    Ok(())
}
