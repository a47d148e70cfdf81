//! The twinfs binary, driven without mounting anything.

mod common;

use assert_cmd::Command;
use common::{get_twinfs_path, write_file};
use predicates::prelude::*;
use tempfile::TempDir;

struct CliWorkspace {
    ro: TempDir,
    rw: TempDir,
    config: TempDir,
}

impl CliWorkspace {
    fn new() -> Self {
        CliWorkspace {
            ro: TempDir::new().expect("Failed to create RO branch"),
            rw: TempDir::new().expect("Failed to create RW branch"),
            config: TempDir::new().expect("Failed to create config dir"),
        }
    }

    fn spec(&self) -> String {
        format!("{}:{}", self.ro.path().display(), self.rw.path().display())
    }

    fn twinfs(&self) -> Command {
        let mut cmd = Command::new(get_twinfs_path());
        cmd.env("TWINFS_CONFIG_DIR", self.config.path());
        cmd.env("TWINFS_LOG", "warn");
        cmd
    }
}

#[test]
fn test_check_prints_roles() {
    let ws = CliWorkspace::new();
    let ro = ws.ro.path().canonicalize().unwrap();
    let rw = ws.rw.path().canonicalize().unwrap();

    ws.twinfs()
        .args(["check", &format!("{}=RW:{}", rw.display(), ro.display())])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("RO\t{}", ro.display())))
        .stdout(predicate::str::contains(format!("RW\t{}", rw.display())));
}

#[test]
fn test_check_rejects_bad_specs() {
    let ws = CliWorkspace::new();

    ws.twinfs()
        .args([
            "check",
            &format!("{}=RO:{}=RO", ws.ro.path().display(), ws.rw.path().display()),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("both branches are RO"));

    ws.twinfs()
        .args([
            "check",
            &format!("{}:{}", ws.ro.path().display(), ws.ro.path().display()),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("same directory"));
}

#[test]
fn test_ls_porcelain_and_json() {
    let ws = CliWorkspace::new();
    write_file(&ws.ro.path().join("base.txt"), b"ro");
    write_file(&ws.ro.path().join("gone.txt"), b"ro");
    write_file(&ws.rw.path().join(".wh.gone.txt"), b"");
    write_file(&ws.rw.path().join("added.txt"), b"rw");

    ws.twinfs()
        .args(["ls", &ws.spec(), "/", "--porcelain"])
        .assert()
        .success()
        .stdout("added.txt\tfile\tRW\nbase.txt\tfile\tRO\n");

    let output = ws
        .twinfs()
        .args(["ls", &ws.spec(), "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["added.txt", "base.txt"]);
    assert_eq!(entries[1]["origin"], "RO");
}

#[test]
fn test_ls_missing_directory_fails() {
    let ws = CliWorkspace::new();
    ws.twinfs()
        .args(["ls", &ws.spec(), "/nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_fsck_reports_and_repairs() {
    let ws = CliWorkspace::new();
    write_file(&ws.rw.path().join("both"), b"");
    write_file(&ws.rw.path().join(".wh.both"), b"");

    ws.twinfs()
        .args(["fsck", &ws.spec()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("whiteout beside RW object"));
    assert!(ws.rw.path().join(".wh.both").exists());

    ws.twinfs()
        .args(["fsck", &ws.spec(), "--repair"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 stale marker(s)"));
    assert!(!ws.rw.path().join(".wh.both").exists());

    ws.twinfs()
        .args(["fsck", &ws.spec()])
        .assert()
        .success()
        .stdout(predicate::str::contains("No problems found"));
}

#[test]
fn test_config_init_and_show() {
    let ws = CliWorkspace::new();

    ws.twinfs()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            ws.config.path().join("config.toml").display().to_string(),
        ));

    ws.twinfs()
        .args(["config", "init"])
        .assert()
        .success();
    assert!(ws.config.path().join("config.toml").exists());

    ws.twinfs()
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    ws.twinfs()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default_dir_mode: 0o755"))
        .stdout(predicate::str::contains("fuse_ttl_secs: 1"));
}
