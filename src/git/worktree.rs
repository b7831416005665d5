use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::GitPipeline;
use crate::errors::GitError;
use crate::models::{RepoConfig, Task};
use crate::util::slugify;

const BRANCH_SLUG_LEN: usize = 36;

/// A task's isolated checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

/// Sub-step of `cleanup` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    RemoveWorktree,
    Prune,
    DeleteBranch,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoveWorktree => "remove_worktree",
            Self::Prune => "prune",
            Self::DeleteBranch => "delete_branch",
        }
    }
}

/// Deterministic branch for a task: `task/<id>-<slug>`.
pub fn branch_name(task_id: &str, title: &str) -> String {
    let slug = slugify(title, BRANCH_SLUG_LEN);
    if slug.is_empty() {
        format!("task/{task_id}")
    } else {
        format!("task/{task_id}-{slug}")
    }
}

pub fn worktree_path(worktrees_dir: &Path, repo_id: &str, task_id: &str) -> PathBuf {
    worktrees_dir.join(repo_id).join(task_id)
}

/// A relative path that stays inside its root.
fn is_contained(rel: &Path) -> bool {
    rel.components().any(|c| matches!(c, Component::Normal(_)))
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn normalize_rel(rel: &str) -> String {
    let trimmed = rel.trim().trim_end_matches('/');
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

/// Recursively copy `src` into `dest`, skipping any `.git` entry.
fn copy_tree(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)
            .with_context(|| format!("Failed to copy {}", src.display()))?;
        return Ok(());
    }

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(())
}

/// Append `entries` missing from an `info/exclude` file, under an exclusive lock.
fn append_excludes(exclude: &Path, entries: &[String]) -> anyhow::Result<()> {
    if let Some(parent) = exclude.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(exclude)
        .with_context(|| format!("Failed to open {}", exclude.display()))?;
    FileExt::lock_exclusive(&file)?;

    let mut existing = String::new();
    file.read_to_string(&mut existing)?;
    let known: HashSet<&str> = existing.lines().map(str::trim).collect();
    let mut missing = String::new();
    for entry in entries {
        if !known.contains(entry.as_str()) {
            missing.push_str(entry);
            missing.push('\n');
        }
    }
    if !missing.is_empty() {
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.write_all(missing.as_bytes())?;
    }
    FileExt::unlock(&file)?;
    Ok(())
}

impl GitPipeline {
    /// Candidate start points, preferring the remote copy of the main branch.
    async fn base_candidates(&self, root: &Path, main_branch: &str) -> Result<Vec<String>, GitError> {
        let default = self.git.remote_default_branch(root).await?;
        let mut candidates = vec![format!("origin/{main_branch}"), main_branch.to_string()];
        if let Some(default) = default {
            candidates.push(format!("origin/{default}"));
            candidates.push(default);
        }
        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        Ok(candidates)
    }

    /// Create the task's worktree on a fresh branch off the main branch.
    /// An existing task branch is never reused.
    pub async fn create_worktree(&self, repo: &RepoConfig, task: &Task) -> Result<Worktree, GitError> {
        let root = &repo.root_path;
        let branch = branch_name(&task.id, &task.title);
        let path = worktree_path(&self.worktrees_dir, &repo.id, &task.id);

        if !self.git.is_repository(root).await {
            return Err(GitError::WorktreeCreate(format!(
                "{} is not a git repository",
                root.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Drop metadata of worktrees whose directories are gone.
        self.git.run(root, &["worktree", "prune"]).await?;

        if self.git.branch_exists(root, &branch).await? {
            return Err(GitError::WorktreeCreate(format!("branch {branch} already exists")));
        }
        if path.exists() {
            return Err(GitError::WorktreeCreate(format!(
                "worktree path {} already exists",
                path.display()
            )));
        }

        if self.git.has_remote(root, "origin").await? {
            let fetch = self.git.run(root, &["fetch", "origin"]).await?;
            if !fetch.success {
                warn!(repo_id = %repo.id, error = %fetch.detail(), "Fetch before worktree creation failed");
            }
        }

        let candidates = self.base_candidates(root, &repo.main_branch).await?;
        let mut last_error = String::new();
        for base in &candidates {
            let args = [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(&branch),
                path.as_os_str(),
                OsStr::new(base),
            ];
            let output = self.git.run(root, &args).await?;
            if output.success {
                let base_commit = self.git.current_commit(&path).await?;
                info!(task_id = %task.id, branch = %branch, base = %base, "Worktree created");
                return Ok(Worktree {
                    path,
                    branch,
                    base_commit,
                });
            }
            last_error = output.detail();
        }

        Err(GitError::WorktreeCreate(format!(
            "no usable base among {}: {last_error}",
            candidates.join(", ")
        )))
    }

    /// Copy the repository's runtime data paths into the worktree so
    /// concurrent worktrees never share mutable data. Returns the copied paths.
    pub async fn setup_isolated_data(
        &self,
        repo: &RepoConfig,
        worktree: &Path,
    ) -> Result<Vec<String>, GitError> {
        let forbidden: HashSet<String> = repo
            .forbidden_data_paths
            .iter()
            .map(|p| normalize_rel(p))
            .collect();
        let wanted: Vec<String> = repo
            .data_paths
            .iter()
            .map(|p| normalize_rel(p))
            .filter(|p| {
                let ok = is_contained(Path::new(p)) && !forbidden.contains(p);
                if !ok {
                    warn!(repo_id = %repo.id, path = %p, "Skipping data path");
                }
                ok
            })
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let common_dir = self
            .git
            .run_checked(worktree, &["rev-parse", "--git-common-dir"])
            .await?;
        let common_dir = PathBuf::from(common_dir);
        let exclude = if common_dir.is_absolute() {
            common_dir
        } else {
            worktree.join(common_dir)
        }
        .join("info")
        .join("exclude");

        let root = repo.root_path.clone();
        let worktree = worktree.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut copied = Vec::new();
            for rel in wanted {
                let src = root.join(&rel);
                if !src.exists() {
                    continue;
                }
                let dest = worktree.join(&rel);
                if dest.is_dir() {
                    std::fs::remove_dir_all(&dest)?;
                } else if dest.exists() {
                    std::fs::remove_file(&dest)?;
                }
                copy_tree(&src, &dest)?;
                copied.push(rel);
            }
            let entries: Vec<String> = copied.iter().map(|rel| format!("/{rel}")).collect();
            if !entries.is_empty() {
                append_excludes(&exclude, &entries)?;
            }
            Ok(copied)
        })
        .await
        .context("Data copy task panicked")??;
        Ok(copied)
    }

    /// Remove the worktree, prune metadata and delete the branch. Safe to
    /// call on an already removed worktree. Returns the first failed step.
    pub async fn cleanup(
        &self,
        repo: &RepoConfig,
        worktree: &Path,
        branch: Option<&str>,
    ) -> Result<(), (CleanupStep, GitError)> {
        let root = &repo.root_path;

        if worktree.exists() {
            let args = [
                OsStr::new("worktree"),
                OsStr::new("remove"),
                OsStr::new("--force"),
                worktree.as_os_str(),
            ];
            let removed = self
                .git
                .run(root, &args)
                .await
                .map_err(|e| (CleanupStep::RemoveWorktree, e))?;
            if !removed.success {
                debug!(path = %worktree.display(), error = %removed.detail(), "git worktree remove failed, deleting directory");
            }
            if worktree.exists() {
                tokio::fs::remove_dir_all(worktree)
                    .await
                    .with_context(|| format!("Failed to delete {}", worktree.display()))
                    .map_err(|e| (CleanupStep::RemoveWorktree, e.into()))?;
            }
        }

        if root.exists() {
            self.git
                .run_checked(root, &["worktree", "prune"])
                .await
                .map_err(|e| (CleanupStep::Prune, e))?;

            if let Some(branch) = branch.filter(|b| !b.is_empty()) {
                let exists = self
                    .git
                    .branch_exists(root, branch)
                    .await
                    .map_err(|e| (CleanupStep::DeleteBranch, e))?;
                if exists {
                    self.git
                        .run_checked(root, &["branch", "-D", branch])
                        .await
                        .map_err(|e| (CleanupStep::DeleteBranch, e))?;
                }
            }
        }
        Ok(())
    }

    /// Copy diagnostics of a failed attempt to `artifacts/<task>/<run>/`:
    /// the worktree without `.git`, `diff.patch`, `status.txt`, the event
    /// log and the test output when there is one.
    pub async fn snapshot(
        &self,
        task_id: &str,
        run_id: &str,
        worktree: &Path,
        base_commit: Option<&str>,
        events_log: &Path,
        test_output: Option<&str>,
    ) -> Result<PathBuf, GitError> {
        let target = self.artifacts_dir.join(task_id).join(run_id);
        if target.exists() {
            tokio::fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("Failed to clear {}", target.display()))?;
        }
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create {}", target.display()))?;

        if worktree.is_dir() {
            // Untracked files show up in the diff once they are intent-to-add.
            self.git.run(worktree, &["add", "--intent-to-add", "."]).await?;
            let base = base_commit.unwrap_or("HEAD");
            let diff = self.git.run(worktree, &["diff", base]).await?;
            tokio::fs::write(target.join("diff.patch"), diff.stdout)
                .await
                .context("Failed to write diff.patch")?;
            let status = self.git.run(worktree, &["status", "--short", "--branch"]).await?;
            tokio::fs::write(target.join("status.txt"), status.stdout)
                .await
                .context("Failed to write status.txt")?;

            let src = worktree.to_path_buf();
            let dest = target.join("worktree");
            tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
                .await
                .context("Snapshot copy task panicked")??;
        }

        if events_log.is_file() {
            tokio::fs::copy(events_log, target.join("events.ndjson"))
                .await
                .context("Failed to copy event log")?;
        }
        if let Some(output) = test_output {
            tokio::fs::write(target.join("test-output.txt"), output)
                .await
                .context("Failed to write test output")?;
        }
        info!(task_id, run_id, path = %target.display(), "Artifacts saved");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepopilotToml, Settings};
    use crate::git::testing::{git, repo_with_origin};
    use crate::models::{NewTask, TaskMode, TaskStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn pipeline(root: &Path) -> GitPipeline {
        let settings = Settings::from_toml(root, &RepopilotToml::default());
        GitPipeline::new(&settings)
    }

    fn task(id: &str, title: &str) -> Task {
        let new = NewTask::new("web", title, "p", TaskMode::Exec);
        Task {
            id: id.to_string(),
            repo_id: new.repo_id,
            title: new.title,
            prompt: new.prompt,
            mode: new.mode,
            status: TaskStatus::Running,
            permission_mode: new.permission_mode,
            priority: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            current_run_id: None,
            claude_session_id: None,
            worker_id: None,
            plan_result: None,
            plan_answers: Default::default(),
            exec_strategy: None,
            pr_url: None,
            error_code: None,
            failure_reason: None,
            error_message: None,
            cancel_requested: false,
        }
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(
            branch_name("260101-001", "Add input validation!"),
            "task/260101-001-add-input-validation"
        );
        assert_eq!(branch_name("260101-002", "???"), "task/260101-002");
        let long = branch_name("260101-003", &"word ".repeat(20));
        assert!(long.len() <= "task/260101-003-".len() + BRANCH_SLUG_LEN);
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(Path::new("data/db")));
        assert!(is_contained(Path::new("./data")));
        assert!(!is_contained(Path::new("../secrets")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(!is_contained(Path::new("data/../../x")));
        assert!(!is_contained(Path::new(".")));
    }

    #[tokio::test]
    async fn test_create_worktree_and_cleanup_twice() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        let git_pipeline = pipeline(dir.path());
        let repo = RepoConfig::new("web", "web", root.clone());
        let task = task("260101-001", "Fix login");

        let wt = git_pipeline.create_worktree(&repo, &task).await.unwrap();
        assert!(wt.path.join("README.md").exists());
        assert_eq!(wt.branch, "task/260101-001-fix-login");
        assert_eq!(wt.base_commit, git(&root, &["rev-parse", "main"]));

        git_pipeline
            .cleanup(&repo, &wt.path, Some(&wt.branch))
            .await
            .unwrap();
        assert!(!wt.path.exists());
        assert!(!git_pipeline.git.branch_exists(&root, &wt.branch).await.unwrap());

        // Idempotent on an already removed worktree.
        git_pipeline
            .cleanup(&repo, &wt.path, Some(&wt.branch))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_existing_branch_is_a_hard_failure() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        let git_pipeline = pipeline(dir.path());
        let repo = RepoConfig::new("web", "web", root.clone());
        let task = task("260101-001", "Fix login");
        git(&root, &["branch", "task/260101-001-fix-login"]);

        let err = git_pipeline.create_worktree(&repo, &task).await.unwrap_err();
        assert!(matches!(err, GitError::WorktreeCreate(_)));
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_create_worktree_without_origin_uses_local_main() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("local");
        std::fs::create_dir_all(&root).unwrap();
        git(&root, &["init", "-b", "main"]);
        crate::git::testing::configure_identity(&root);
        std::fs::write(root.join("a.txt"), "a").unwrap();
        git(&root, &["add", "-A"]);
        git(&root, &["commit", "-m", "init"]);

        let git_pipeline = pipeline(dir.path());
        let repo = RepoConfig::new("local", "local", root);
        let wt = git_pipeline
            .create_worktree(&repo, &task("260101-002", "x"))
            .await
            .unwrap();
        assert!(wt.path.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_create_worktree_rejects_non_repository() {
        let dir = tempdir().unwrap();
        let git_pipeline = pipeline(dir.path());
        let repo = RepoConfig::new("nope", "nope", dir.path().join("missing"));
        std::fs::create_dir_all(&repo.root_path).unwrap();
        assert!(matches!(
            git_pipeline.create_worktree(&repo, &task("260101-003", "x")).await,
            Err(GitError::WorktreeCreate(_))
        ));
    }

    #[tokio::test]
    async fn test_isolated_data_is_copied_and_excluded() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        std::fs::create_dir_all(root.join("data/db")).unwrap();
        std::fs::write(root.join("data/db/app.sqlite"), "rows").unwrap();
        std::fs::write(root.join("PROGRESS.md"), "secret").unwrap();
        std::fs::write(root.join(".env.local"), "KEY=1").unwrap();

        let git_pipeline = pipeline(dir.path());
        let mut repo = RepoConfig::new("web", "web", root.clone());
        repo.data_paths = vec![
            "data".into(),
            ".env.local".into(),
            "PROGRESS.md".into(),
            "../escape".into(),
            "missing".into(),
        ];
        let wt = git_pipeline
            .create_worktree(&repo, &task("260101-004", "data"))
            .await
            .unwrap();

        let copied = git_pipeline.setup_isolated_data(&repo, &wt.path).await.unwrap();
        assert_eq!(copied, vec!["data".to_string(), ".env.local".to_string()]);
        assert_eq!(
            std::fs::read_to_string(wt.path.join("data/db/app.sqlite")).unwrap(),
            "rows"
        );
        assert!(!wt.path.join("PROGRESS.md").exists());
        assert!(!std::fs::symlink_metadata(wt.path.join("data")).unwrap().file_type().is_symlink());

        // Copies are private to the worktree.
        std::fs::write(wt.path.join("data/db/app.sqlite"), "changed").unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("data/db/app.sqlite")).unwrap(),
            "rows"
        );
        // And do not count as changes.
        assert_eq!(git(&wt.path, &["status", "--porcelain"]), "");

        // Running it again does not duplicate exclude entries.
        git_pipeline.setup_isolated_data(&repo, &wt.path).await.unwrap();
        let exclude = std::fs::read_to_string(root.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.lines().filter(|l| *l == "/data").count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_copies_diagnostics() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        let git_pipeline = pipeline(dir.path());
        let repo = RepoConfig::new("web", "web", root);
        let wt = git_pipeline
            .create_worktree(&repo, &task("260101-005", "snap"))
            .await
            .unwrap();
        std::fs::write(wt.path.join("new.txt"), "hello").unwrap();
        let events = dir.path().join("events.ndjson");
        std::fs::write(&events, "{\"seq\":1}\n").unwrap();

        let target = git_pipeline
            .snapshot(
                "260101-005",
                "260101-001",
                &wt.path,
                Some(&wt.base_commit),
                &events,
                Some("1 failed"),
            )
            .await
            .unwrap();
        assert_eq!(target, git_pipeline.artifacts_dir().join("260101-005/260101-001"));
        assert!(target.join("worktree/new.txt").exists());
        assert!(!target.join("worktree/.git").exists());
        let diff = std::fs::read_to_string(target.join("diff.patch")).unwrap();
        assert!(diff.contains("new.txt"));
        assert!(target.join("events.ndjson").exists());
        assert_eq!(
            std::fs::read_to_string(target.join("test-output.txt")).unwrap(),
            "1 failed"
        );
    }
}
