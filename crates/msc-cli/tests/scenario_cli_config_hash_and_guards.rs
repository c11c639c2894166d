//! Scenario: CLI config handling needs no database.
//!
//! - `msc config-hash` is deterministic over layered files.
//! - `msc consume` refuses to start when the URL env var is missing or the
//!   config carries a secret literal, before any connection attempt.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn msc(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("msc").expect("msc binary");
    // Run from an empty dir so a developer's .env.local is not picked up.
    cmd.current_dir(dir);
    cmd
}

#[test]
fn config_hash_is_stable_and_reflects_overrides() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("base.yaml"), "consumer:\n  max_in_flight: 16\n")?;
    fs::write(dir.path().join("local.yaml"), "consumer:\n  max_in_flight: 4\n")?;

    let first = msc(dir.path())
        .args(["config-hash", "base.yaml", "local.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config_hash="))
        .stdout(predicate::str::contains(r#"{"consumer":{"max_in_flight":4}}"#))
        .get_output()
        .stdout
        .clone();

    let second = msc(dir.path())
        .args(["config-hash", "base.yaml", "local.yaml"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn consume_without_database_env_var_fails_fast() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("c.yaml"),
        "database:\n  url_env: MSC_CLI_TEST_UNSET_DB_URL\n",
    )?;
    fs::write(dir.path().join("in.ndjson"), "")?;

    msc(dir.path())
        .env_remove("MSC_CLI_TEST_UNSET_DB_URL")
        .args(["consume", "--config", "c.yaml", "--input", "in.ndjson"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "SECRET_MISSING: env var MSC_CLI_TEST_UNSET_DB_URL",
        ));
    Ok(())
}

#[test]
fn consume_rejects_config_with_embedded_credentials() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("c.yaml"),
        "database:\n  url: \"postgres://scanner:hunter2@db:5432/scans\"\n",
    )?;

    msc(dir.path())
        .args(["consume", "--config", "c.yaml", "--input", "-"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("hunter2").not());
    Ok(())
}
