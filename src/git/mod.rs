//! Git worktree management and the delivery pipeline.
//!
//! Everything goes through the external `git` binary. The pipeline stages
//! live in their own files:
//!
//! | File           | Operations                                          |
//! |----------------|-----------------------------------------------------|
//! | `worktree.rs`  | create, isolated data, cleanup, artifact snapshot   |
//! | `delivery.rs`  | commit, rebase, test, push                          |
//! | `pr.rs`        | pull request creation and compare-URL fallback      |

mod delivery;
mod pr;
mod worktree;

pub use pr::{build_compare_url, parse_github_remote};
pub use worktree::{CleanupStep, Worktree, branch_name, worktree_path};

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::debug;

use crate::config::Settings;
use crate::errors::GitError;

/// Output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Most useful error text: stderr, else stdout.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs the configured git binary.
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
}

impl Git {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Run git in `cwd`. A non-zero exit is not an error here; only failing
    /// to spawn the binary is.
    pub async fn run<S: AsRef<OsStr>>(&self, cwd: &Path, args: &[S]) -> Result<GitOutput, GitError> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.program, display_args(args)))?;

        let result = GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(cwd = %cwd.display(), args = %display_args(args), code = ?result.code, "git");
        Ok(result)
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    pub async fn run_checked<S: AsRef<OsStr>>(&self, cwd: &Path, args: &[S]) -> Result<String, GitError> {
        let output = self.run(cwd, args).await?;
        if !output.success {
            return Err(GitError::Command {
                args: display_args(args),
                stderr: output.detail(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    pub async fn current_commit(&self, path: &Path) -> Result<String, GitError> {
        self.run_checked(path, &["rev-parse", "HEAD"]).await
    }

    pub async fn has_remote(&self, path: &Path, remote: &str) -> Result<bool, GitError> {
        Ok(self.run(path, &["remote", "get-url", remote]).await?.success)
    }

    pub async fn remote_url(&self, path: &Path, remote: &str) -> Result<Option<String>, GitError> {
        let output = self.run(path, &["remote", "get-url", remote]).await?;
        Ok(output
            .success
            .then(|| output.stdout.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub async fn branch_exists(&self, path: &Path, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{branch}");
        Ok(self
            .run(path, &["show-ref", "--verify", "--quiet", reference.as_str()])
            .await?
            .success)
    }

    /// Branch `origin/HEAD` points at, if the remote advertises one.
    pub async fn remote_default_branch(&self, path: &Path) -> Result<Option<String>, GitError> {
        let output = self
            .run(path, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await?;
        if !output.success {
            return Ok(None);
        }
        Ok(output
            .stdout
            .trim()
            .strip_prefix("refs/remotes/origin/")
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    pub async fn is_repository(&self, path: &Path) -> bool {
        self.run(path, &["rev-parse", "--git-dir"])
            .await
            .is_ok_and(|o| o.success)
    }
}

fn display_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Worktree lifecycle and delivery stages for task branches.
#[derive(Debug, Clone)]
pub struct GitPipeline {
    git: Git,
    gh_cmd: String,
    github_token: Option<String>,
    github_api_url: String,
    worktrees_dir: PathBuf,
    artifacts_dir: PathBuf,
    test_timeout: Duration,
    http: reqwest::Client,
}

impl GitPipeline {
    pub fn new(settings: &Settings) -> Self {
        Self {
            git: Git::new(&settings.git_cmd),
            gh_cmd: settings.gh_cmd.clone(),
            github_token: settings.github_token.clone(),
            github_api_url: settings.github_api_url.clone(),
            worktrees_dir: settings.worktrees_dir.clone(),
            artifacts_dir: settings.artifacts_dir.clone(),
            test_timeout: settings.test_timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }
}


#[cfg(test)]
mod tests {
    use super::testing::repo_with_origin;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_reports_exit_without_error() {
        let dir = tempdir().unwrap();
        let git = Git::new("git");
        let output = git.run(dir.path(), &["rev-parse", "HEAD"]).await.unwrap();
        assert!(!output.success);
        assert!(!output.detail().is_empty());
        assert!(matches!(
            git.run_checked(dir.path(), &["rev-parse", "HEAD"]).await,
            Err(GitError::Command { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_other_error() {
        let dir = tempdir().unwrap();
        let git = Git::new("/nonexistent/git-binary");
        assert!(matches!(
            git.run(dir.path(), &["status"]).await,
            Err(GitError::Other(_))
        ));
    }

    #[tokio::test]
    async fn test_repository_queries() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        let git = Git::new("git");
        assert!(git.is_repository(&root).await);
        assert!(!git.is_repository(dir.path()).await);
        assert!(git.has_remote(&root, "origin").await.unwrap());
        assert!(git.remote_url(&root, "upstream").await.unwrap().is_none());
        assert!(git.branch_exists(&root, "main").await.unwrap());
        assert!(!git.branch_exists(&root, "task/x").await.unwrap());
        assert_eq!(git.current_commit(&root).await.unwrap().len(), 40);
    }
}
