//! Integration tests for the repopilot CLI
//!
//! Each test runs the binary against its own root directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a repopilot Command rooted at `dir`
fn repopilot(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("repopilot");
    cmd.current_dir(dir.path())
        .arg("--root")
        .arg(dir.path())
        .env_remove("REPOPILOT_ROOT")
        .env_remove("REPOPILOT_WORKERS")
        .env_remove("RUST_LOG");
    cmd
}

fn git(cwd: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed");
}

/// A root with one committed repository at `repos/web`, registered.
fn root_with_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repos/web");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.name", "Cli Test"]);
    git(&repo, &["config", "user.email", "cli@example.com"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    git(&repo, &["remote", "add", "origin", "https://github.com/acme/web.git"]);
    std::fs::write(repo.join("README.md"), "# web\n").unwrap();
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-m", "initial"]);

    repopilot(&dir).args(["repo", "rescan"]).assert().success();
    dir
}

fn create_task(dir: &TempDir, title: &str, mode: &str) -> String {
    let output = repopilot(dir)
        .args(["--json", "task", "create", "--repo", "web", "--title", title])
        .args(["--prompt", "add input validation", "--mode", mode])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let task: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    task["id"].as_str().unwrap().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        repopilot(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        repopilot(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_empty_root_lists_nothing() {
        let dir = TempDir::new().unwrap();
        repopilot(&dir)
            .args(["repo", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No repositories registered"));
        repopilot(&dir)
            .args(["task", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks."));
        assert!(dir.path().join("state").is_dir());
        assert!(dir.path().join("worktrees").is_dir());
    }
}

// =============================================================================
// Repository Registry Tests
// =============================================================================

mod repos {
    use super::*;

    #[test]
    fn test_rescan_registers_github_remote() {
        let dir = root_with_repo();
        repopilot(&dir)
            .args(["repo", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("web"))
            .stdout(predicate::str::contains("acme/web"));
    }

    #[test]
    fn test_set_disables_repository() {
        let dir = root_with_repo();
        repopilot(&dir)
            .args(["--json", "repo", "set", "web", "--enabled", "false"])
            .args(["--test-command", "make check"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"enabled\": false"))
            .stdout(predicate::str::contains("make check"));

        repopilot(&dir)
            .args(["task", "create", "--repo", "web", "--title", "t", "--prompt", "p"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("disabled"));
    }

    #[test]
    fn test_add_rejects_plain_directory() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        repopilot(&dir)
            .args(["repo", "add"])
            .arg(&plain)
            .assert()
            .failure()
            .stderr(predicate::str::contains("not a git repository"));
    }
}

// =============================================================================
// Task Lifecycle Tests
// =============================================================================

mod tasks {
    use super::*;

    #[test]
    fn test_create_and_list() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Add validation", "plan");

        repopilot(&dir)
            .args(["task", "list", "--status", "todo"])
            .assert()
            .success()
            .stdout(predicate::str::contains(id.as_str()))
            .stdout(predicate::str::contains("Add validation"));
        repopilot(&dir)
            .args(["task", "list", "--keyword", "nothing-matches"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks."));
    }

    #[test]
    fn test_unknown_repository_is_rejected() {
        let dir = TempDir::new().unwrap();
        repopilot(&dir)
            .args(["task", "create", "--repo", "nope", "--title", "t", "--prompt", "p"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_cancel_then_retry() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Cancel me", "exec");

        repopilot(&dir)
            .args(["--json", "task", "cancel", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"CANCELLED\""));
        repopilot(&dir)
            .args(["task", "events", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("worktree cleanup on CANCELLED"));
        repopilot(&dir)
            .args(["notifications", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Task cancelled: Cancel me"));

        repopilot(&dir)
            .args(["--json", "task", "retry", &id, "--mode", "plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"TODO\""))
            .stdout(predicate::str::contains("\"mode\": \"PLAN\""));
    }

    #[test]
    fn test_confirm_requires_plan_review() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Not planned yet", "plan");
        repopilot(&dir)
            .args(["task", "confirm", &id, "--answer", "q1=a"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("INVALID_STATUS"));
        repopilot(&dir)
            .args(["task", "confirm", &id, "--answer", "broken"])
            .assert()
            .failure();
    }

    #[test]
    fn test_done_requires_review() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Queued", "exec");
        repopilot(&dir)
            .args(["task", "done", &id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("REVIEW"));
    }
}

// =============================================================================
// Views Tests
// =============================================================================

mod views {
    use super::*;

    #[test]
    fn test_board_counts() {
        let dir = root_with_repo();
        create_task(&dir, "One", "plan");
        let two = create_task(&dir, "Two", "exec");
        repopilot(&dir).args(["task", "cancel", &two]).assert().success();

        let output = repopilot(&dir)
            .args(["--json", "board", "--repo", "web"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let board: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(board["counts"]["TODO"], 1);
        assert_eq!(board["counts"]["CANCELLED"], 1);
        assert_eq!(board["counts"]["RUNNING"], 0);
    }

    #[test]
    fn test_batch_confirm_reports_failures() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Queued plan", "plan");
        let output = repopilot(&dir)
            .args(["--json", "plan", "batch-confirm", &id, &id, "missing"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let outcome: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(outcome["counts"]["requested"], 2);
        assert_eq!(outcome["counts"]["failed"], 2);
        assert_eq!(outcome["failed"][0]["error_code"], "INVALID_STATUS");
        assert_eq!(outcome["failed"][1]["error_code"], "TASK_NOT_FOUND");
    }

    #[test]
    fn test_notifications_read_all() {
        let dir = root_with_repo();
        let id = create_task(&dir, "Note", "exec");
        repopilot(&dir).args(["task", "cancel", &id]).assert().success();
        repopilot(&dir)
            .args(["notifications", "read"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Marked 1 notification(s) read."));
        repopilot(&dir)
            .args(["--json", "notifications", "list", "--unread"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
        repopilot(&dir)
            .args(["notifications", "read", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}
