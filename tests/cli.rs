//! CLI tests for pcc.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A pcc command rooted in `dir`, isolated from the caller's environment.
fn pcc(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("pcc");
    cmd.current_dir(dir.path())
        .env_remove("PCC_DB_PATH")
        .env_remove("PCC_CONFIG")
        .env_remove("PCC_PORT")
        .env("PCC_LOG", "error");
    cmd
}

fn init(dir: &TempDir) {
    pcc(dir).arg("init").assert().success();
}

fn add_project(dir: &TempDir, id: &str) {
    pcc(dir)
        .args(["project", "add", id, "/srv/app", "--id", id])
        .assert()
        .success();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        pcc(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        pcc(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = TempDir::new().unwrap();
        pcc(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized pcc"));

        assert!(dir.path().join(".pcc/pcc.toml").exists());
        assert!(dir.path().join(".pcc/pcc.db").exists());
        assert!(dir.path().join(".pcc/artifacts/runs").is_dir());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        init(&dir);
    }

    #[test]
    fn test_db_path_override() {
        let dir = TempDir::new().unwrap();
        pcc(&dir)
            .args(["--db-path", "elsewhere.db", "init"])
            .assert()
            .success();
        assert!(dir.path().join("elsewhere.db").exists());
    }
}

mod projects {
    use super::*;

    #[test]
    fn test_add_and_list() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        add_project(&dir, "shop");

        pcc(&dir)
            .args(["project", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"id\": \"shop\""));
    }

    #[test]
    fn test_duplicate_id_fails() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        add_project(&dir, "shop");
        pcc(&dir)
            .args(["project", "add", "shop", "/srv/app", "--id", "shop"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_priority_out_of_range_fails() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        pcc(&dir)
            .args(["project", "add", "x", "/srv/x", "--priority", "9"])
            .assert()
            .failure();
    }
}

mod work_orders {
    use super::*;

    fn write_orders(dir: &TempDir) -> std::path::PathBuf {
        let orders = dir.path().join("orders");
        fs::create_dir_all(&orders).unwrap();
        fs::write(
            orders.join("01-login.md"),
            "---\nid: WO-1\ntitle: Add login\npriority: 2\n---\nUsers sign in with email.\n",
        )
        .unwrap();
        fs::write(
            orders.join("02-logout.md"),
            "---\nid: WO-2\ntitle: Add logout\ndepends_on: [WO-1]\n---\n",
        )
        .unwrap();
        orders
    }

    #[test]
    fn test_import_directory() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        add_project(&dir, "shop");
        let orders = write_orders(&dir);

        pcc(&dir)
            .arg("import")
            .arg(&orders)
            .args(["--project", "shop"])
            .assert()
            .success()
            .stdout(predicate::str::contains("WO-1").and(predicate::str::contains("WO-2")));

        pcc(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"total\": 1"));
    }

    #[test]
    fn test_import_into_unknown_project_fails() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        let orders = write_orders(&dir);
        pcc(&dir)
            .arg("import")
            .arg(&orders)
            .args(["--project", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_enqueue_backlog_item_fails() {
        let dir = TempDir::new().unwrap();
        init(&dir);
        add_project(&dir, "shop");
        let orders = write_orders(&dir);
        pcc(&dir)
            .arg("import")
            .arg(&orders)
            .args(["--project", "shop"])
            .assert()
            .success();

        pcc(&dir).args(["enqueue", "WO-1"]).assert().failure();
    }
}

mod config {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        pcc(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 3141"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".pcc")).unwrap();
        fs::write(
            dir.path().join(".pcc/pcc.toml"),
            "[vm]\nprovider = \"gcloud\"\n",
        )
        .unwrap();
        pcc(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("gcloud_project"));
    }
}
