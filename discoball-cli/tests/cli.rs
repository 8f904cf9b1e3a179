#![cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use std::path::Path;

use anyhow::Result;
use duct::{cmd, Expression};
use testdir::testdir;

fn discoball_bin() -> &'static str {
    env!("CARGO_BIN_EXE_discoball")
}

/// Run discoball with its config and data directories inside `home`.
fn discoball(home: &Path, args: &[&str]) -> Expression {
    cmd(discoball_bin(), args)
        .env("DISCOBALL_CONFIG_DIR", home.join("config"))
        .env("DISCOBALL_DATA_DIR", home.join("data"))
        .env("RUST_LOG", "discoball=debug")
        .stdout_capture()
        .stderr_capture()
        .unchecked()
}

#[test]
fn cli_party_create_sample() -> Result<()> {
    let home = testdir!();
    let friends = home.join("friends.txt");
    let friends_arg = friends.to_string_lossy().to_string();

    let out = discoball(&home, &["party", "--create-sample", "--friends-file", &friends_arg]).run()?;
    assert!(out.status.success(), "{out:?}");
    assert_eq!(
        std::fs::read_to_string(&friends)?,
        discoball::trust::SAMPLE
    );

    // never overwrites an existing list
    std::fs::write(&friends, "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed\n")?;
    let out = discoball(&home, &["party", "--create-sample", "--friends-file", &friends_arg]).run()?;
    assert!(!out.status.success());
    assert!(String::from_utf8(out.stderr)?.contains("already exists"));
    assert_eq!(
        std::fs::read_to_string(&friends)?,
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed\n"
    );
    Ok(())
}

#[test]
fn cli_party_empty_friends_list() -> Result<()> {
    let home = testdir!();
    let friends = home.join("friends.txt");
    std::fs::write(&friends, discoball::trust::SAMPLE)?;

    let out = discoball(
        &home,
        &["party", "--friends-file", &friends.to_string_lossy()],
    )
    .run()?;
    assert!(out.status.success(), "{out:?}");
    assert!(String::from_utf8(out.stdout)?.contains("nothing to do"));
    Ok(())
}

#[test]
fn cli_party_missing_friends_list() -> Result<()> {
    let home = testdir!();
    let missing = home.join("nope.txt");

    let out = discoball(
        &home,
        &["party", "--friends-file", &missing.to_string_lossy()],
    )
    .run()?;
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8(out.stderr)?.contains("--create-sample"));
    Ok(())
}

#[test]
fn cli_rejects_bad_config() -> Result<()> {
    let home = testdir!();
    let config = home.join("bad.toml");
    std::fs::write(&config, "not_a_setting = 1\n")?;
    let friends = home.join("friends.txt");
    std::fs::write(&friends, "")?;

    let out = discoball(
        &home,
        &[
            "party",
            "--config",
            &config.to_string_lossy(),
            "--friends-file",
            &friends.to_string_lossy(),
        ],
    )
    .run()?;
    assert!(!out.status.success());
    Ok(())
}

#[test]
fn cli_unknown_subcommand() -> Result<()> {
    let home = testdir!();
    let out = discoball(&home, &["limbo"]).run()?;
    assert!(!out.status.success());
    Ok(())
}
