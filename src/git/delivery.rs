use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use super::GitPipeline;
use crate::errors::GitError;
use crate::util::tail_chars;

/// Output kept from a failing test command.
const TEST_OUTPUT_TAIL: usize = 4000;

impl GitPipeline {
    /// Whether the working tree has uncommitted changes (including untracked files).
    pub async fn has_changes(&self, path: &Path) -> Result<bool, GitError> {
        let status = self.git.run_checked(path, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Whether HEAD is no longer `base_commit`, i.e. the agent committed itself.
    pub async fn head_moved(&self, path: &Path, base_commit: &str) -> Result<bool, GitError> {
        Ok(self.git.current_commit(path).await? != base_commit)
    }

    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    pub async fn commit(&self, path: &Path, message: &str) -> Result<bool, GitError> {
        let add = self.git.run(path, &["add", "-A"]).await?;
        if !add.success {
            return Err(GitError::Commit(add.detail()));
        }
        let staged = self.git.run(path, &["diff", "--cached", "--quiet"]).await?;
        match staged.code {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => return Err(GitError::Commit(staged.detail())),
        }
        let commit = self.git.run(path, &["commit", "-m", message]).await?;
        if !commit.success {
            return Err(GitError::Commit(commit.detail()));
        }
        Ok(true)
    }

    /// Rebase the task branch onto the latest main branch. Conflicts abort
    /// the rebase and are reported as `RebaseConflict`.
    pub async fn rebase(&self, path: &Path, main_branch: &str) -> Result<(), GitError> {
        let onto = if self.git.has_remote(path, "origin").await? {
            let fetch = self.git.run(path, &["fetch", "origin", main_branch]).await?;
            if !fetch.success {
                return Err(GitError::Rebase(format!(
                    "fetch origin {main_branch}: {}",
                    fetch.detail()
                )));
            }
            format!("origin/{main_branch}")
        } else {
            main_branch.to_string()
        };

        let rebase = self.git.run(path, &["rebase", onto.as_str()]).await?;
        if rebase.success {
            return Ok(());
        }

        let conflicted = self
            .git
            .run(path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let files: Vec<String> = conflicted
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let abort = self.git.run(path, &["rebase", "--abort"]).await?;
        if !abort.success {
            warn!(path = %path.display(), error = %abort.detail(), "git rebase --abort failed");
        }

        if files.is_empty() && !rebase.stdout.contains("CONFLICT") {
            return Err(GitError::Rebase(rebase.detail()));
        }
        Err(GitError::RebaseConflict(if files.is_empty() {
            format!("rebase onto {onto} stopped on conflicts")
        } else {
            format!("conflicts in {}", files.join(", "))
        }))
    }

    /// Run the repository's test command through `sh -c`. Returns the
    /// combined output on success.
    pub async fn run_tests(&self, path: &Path, test_command: &str) -> Result<String, GitError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(test_command)
            .current_dir(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn test command: {test_command}"))?;

        let output = match tokio::time::timeout(self.test_timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Failed to wait for test command")?,
            Err(_) => {
                return Err(GitError::TestFailure {
                    exit_code: None,
                    output: format!(
                        "test command timed out after {}s",
                        self.test_timeout.as_secs()
                    ),
                });
            }
        };

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .trim()
        .to_string();

        if output.status.success() {
            info!(path = %path.display(), "Tests passed");
            return Ok(combined);
        }

        let mut message = tail_chars(&combined, TEST_OUTPUT_TAIL).to_string();
        if combined.contains("Missing script: \"test\"") {
            message = format!(
                "npm script \"test\" not found; set the repository test command \
                 (for example \"npm run test:unit\" or \"echo skip-tests\")\n{message}"
            );
        }
        Err(GitError::TestFailure {
            exit_code: output.status.code(),
            output: message,
        })
    }

    pub async fn push(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let push = self.git.run(path, &["push", "-u", "origin", branch]).await?;
        if !push.success {
            return Err(GitError::Push(push.detail()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{RepopilotToml, Settings};
    use crate::git::testing::{configure_identity, git, repo_with_origin};
    use tempfile::tempdir;

    fn pipeline(root: &Path) -> GitPipeline {
        let mut settings = Settings::from_toml(root, &RepopilotToml::default());
        settings.test_timeout = Duration::from_secs(5);
        GitPipeline::new(&settings)
    }

    /// A task branch checked out in a clone of the origin.
    fn task_clone(dir: &Path) -> std::path::PathBuf {
        let root = repo_with_origin(dir, "web");
        git(&root, &["checkout", "-b", "task/1"]);
        root
    }

    #[tokio::test]
    async fn test_commit_reports_no_changes() {
        let dir = tempdir().unwrap();
        let path = task_clone(dir.path());
        let p = pipeline(dir.path());
        assert!(!p.has_changes(&path).await.unwrap());
        assert!(!p.commit(&path, "nothing").await.unwrap());

        std::fs::write(path.join("feature.txt"), "x").unwrap();
        assert!(p.has_changes(&path).await.unwrap());
        let base = p.git.current_commit(&path).await.unwrap();
        assert!(p.commit(&path, "task(1): apply changes").await.unwrap());
        assert!(p.head_moved(&path, &base).await.unwrap());
        assert_eq!(git(&path, &["log", "-1", "--format=%s"]), "task(1): apply changes");
    }

    #[tokio::test]
    async fn test_rebase_onto_updated_main() {
        let dir = tempdir().unwrap();
        let path = task_clone(dir.path());
        let p = pipeline(dir.path());
        std::fs::write(path.join("feature.txt"), "x").unwrap();
        p.commit(&path, "feature").await.unwrap();

        // Someone else lands a change on main.
        let other = dir.path().join("other");
        git(dir.path(), &["clone", dir.path().join("origins/web.git").to_str().unwrap(), "other"]);
        configure_identity(&other);
        std::fs::write(other.join("upstream.txt"), "u").unwrap();
        git(&other, &["add", "-A"]);
        git(&other, &["commit", "-m", "upstream"]);
        git(&other, &["push", "origin", "main"]);

        p.rebase(&path, "main").await.unwrap();
        assert!(path.join("upstream.txt").exists());
        assert!(path.join("feature.txt").exists());
    }

    #[tokio::test]
    async fn test_rebase_conflict_is_distinct_and_aborted() {
        let dir = tempdir().unwrap();
        let path = task_clone(dir.path());
        let p = pipeline(dir.path());
        std::fs::write(path.join("README.md"), "ours\n").unwrap();
        p.commit(&path, "ours").await.unwrap();

        let other = dir.path().join("other");
        git(dir.path(), &["clone", dir.path().join("origins/web.git").to_str().unwrap(), "other"]);
        configure_identity(&other);
        std::fs::write(other.join("README.md"), "theirs\n").unwrap();
        git(&other, &["commit", "-am", "theirs"]);
        git(&other, &["push", "origin", "main"]);

        let err = p.rebase(&path, "main").await.unwrap_err();
        assert!(matches!(err, GitError::RebaseConflict(_)), "{err}");
        assert!(!path.join(".git/rebase-merge").exists());
        assert_eq!(std::fs::read_to_string(path.join("README.md")).unwrap(), "ours\n");
    }

    #[tokio::test]
    async fn test_rebase_fetch_failure_is_rebase_failed() {
        let dir = tempdir().unwrap();
        let path = task_clone(dir.path());
        git(&path, &["remote", "set-url", "origin", "/nonexistent/origin.git"]);
        let err = pipeline(dir.path()).rebase(&path, "main").await.unwrap_err();
        assert!(matches!(err, GitError::Rebase(_)));
    }

    #[tokio::test]
    async fn test_run_tests_pass_fail_and_timeout() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let out = p.run_tests(dir.path(), "echo all good").await.unwrap();
        assert_eq!(out, "all good");

        match p.run_tests(dir.path(), "echo broken >&2; exit 3").await {
            Err(GitError::TestFailure { exit_code, output }) => {
                assert_eq!(exit_code, Some(3));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut slow = pipeline(dir.path());
        slow.test_timeout = Duration::from_millis(200);
        match slow.run_tests(dir.path(), "sleep 5").await {
            Err(GitError::TestFailure { exit_code, output }) => {
                assert_eq!(exit_code, None);
                assert!(output.contains("timed out"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_tests_missing_npm_script_hint() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let command = r#"echo 'npm error Missing script: "test"' >&2; exit 1"#;
        match p.run_tests(dir.path(), command).await {
            Err(GitError::TestFailure { exit_code, output }) => {
                assert_eq!(exit_code, Some(1));
                assert!(output.starts_with("npm script \"test\" not found"), "{output}");
                assert!(output.contains("Missing script: \"test\""));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_to_origin_and_failure() {
        let dir = tempdir().unwrap();
        let path = task_clone(dir.path());
        let p = pipeline(dir.path());
        std::fs::write(path.join("feature.txt"), "x").unwrap();
        p.commit(&path, "feature").await.unwrap();
        p.push(&path, "task/1").await.unwrap();
        let origin = dir.path().join("origins/web.git");
        assert!(!git(&origin, &["branch", "--list", "task/1"]).is_empty());

        git(&path, &["remote", "set-url", "origin", "/nonexistent/origin.git"]);
        assert!(matches!(p.push(&path, "task/1").await, Err(GitError::Push(_))));
    }
}
