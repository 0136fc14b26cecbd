//! Command-line surface of the `nixopus` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A `nixopus` command isolated from the caller's environment.
fn nixopus(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("nixopus");
    cmd.current_dir(dir.path())
        .env_remove("NIXOPUS_CONFIG")
        .env_remove("NIXOPUS_SERVER_URL")
        .env_remove("NIXOPUS_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("dev"))
            .stdout(predicate::str::contains("db"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir).arg("frobnicate").assert().failure();
    }
}

mod config_command {
    use super::*;

    #[test]
    fn test_show_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("port = 8443"));
    }

    #[test]
    fn test_show_reflects_file_and_env() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("nixopus.toml"), "[server]\nport = 9100\n").unwrap();
        nixopus(&dir)
            .env("NIXOPUS_SSH_HOST", "10.9.9.9")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"))
            .stdout(predicate::str::contains("10.9.9.9"));
    }

    #[test]
    fn test_check_reports_problems() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[queue]\nmin_workers = 0\n").unwrap();
        nixopus(&dir)
            .arg("--config")
            .arg(&path)
            .args(["config", "check"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("min_workers"));
    }

    #[test]
    fn test_check_accepts_defaults() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .args(["config", "check"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .args(["--config", "nope.toml", "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.toml"));
    }
}

mod db_command {
    use super::*;

    #[test]
    fn test_init_creates_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state/nested/nixopus.db");
        nixopus(&dir)
            .args(["db", "init", "--path"])
            .arg(&db)
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
        assert!(db.exists());

        // Idempotent.
        nixopus(&dir).args(["db", "init", "--path"]).arg(&db).assert().success();
    }
}

mod dev_command {
    use super::*;

    #[test]
    fn test_requires_token() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .args(["dev", "--app", "abc", "--server", "http://127.0.0.1:1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--token"));
    }

    #[test]
    fn test_requires_server_url() {
        let dir = TempDir::new().unwrap();
        nixopus(&dir)
            .args(["dev", "--app", "abc", "--token", "t"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("server URL"));
    }

    #[test]
    fn test_unreachable_server_fails_fast() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        nixopus(&dir)
            .args(["dev", "--app", "abc", "--token", "t", "--server"])
            .arg(format!("http://127.0.0.1:{port}"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to connect"));
    }
}
