//! Repository discovery under `repos_dir`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::git::{Git, parse_github_remote};
use crate::models::{DiscoveredRepo, RepoConfig};
use crate::store::StoreHandle;

const FALLBACK_BRANCHES: [&str; 2] = ["main", "master"];

/// Inspect one directory. `None` when it is not a git repository.
pub async fn inspect_repo(git: &Git, path: &Path) -> Result<Option<DiscoveredRepo>> {
    if !path.join(".git").exists() || !git.is_repository(path).await {
        return Ok(None);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());

    let github_repo = git
        .remote_url(path, "origin")
        .await?
        .as_deref()
        .and_then(parse_github_remote);

    let main_branch = match git.remote_default_branch(path).await? {
        Some(branch) => branch,
        None => local_default_branch(git, path).await?,
    };

    Ok(Some(DiscoveredRepo {
        name,
        root_path: path.to_path_buf(),
        main_branch,
        github_repo,
    }))
}

async fn local_default_branch(git: &Git, path: &Path) -> Result<String> {
    for branch in FALLBACK_BRANCHES {
        if git.branch_exists(path, branch).await? {
            return Ok(branch.to_string());
        }
    }
    Ok(FALLBACK_BRANCHES[0].to_string())
}

/// Git repositories that are direct children of `repos_dir`, sorted by path.
pub async fn discover_repos(git: &Git, repos_dir: &Path) -> Result<Vec<DiscoveredRepo>> {
    if !repos_dir.is_dir() {
        debug!(dir = %repos_dir.display(), "Repos directory does not exist");
        return Ok(Vec::new());
    }

    let mut candidates: Vec<PathBuf> = WalkDir::new(repos_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    candidates.sort();

    let mut found = Vec::new();
    for path in candidates {
        if let Some(repo) = inspect_repo(git, &path)
            .await
            .with_context(|| format!("Failed to inspect {}", path.display()))?
        {
            found.push(repo);
        }
    }
    Ok(found)
}

/// Scan `repos_dir` and merge the result into the store.
pub async fn rescan(store: &StoreHandle, git: &Git, repos_dir: &Path) -> Result<Vec<RepoConfig>> {
    let found = discover_repos(git, repos_dir).await?;
    info!(dir = %repos_dir.display(), found = found.len(), "Repositories discovered");
    let repos = store
        .call(move |s| s.merge_discovered(found))
        .await
        .context("Failed to merge discovered repositories")?;
    Ok(repos)
}

/// Register a single repository by path.
pub async fn add_repo(store: &StoreHandle, git: &Git, path: &Path) -> Result<RepoConfig> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let Some(discovered) = inspect_repo(git, &path).await? else {
        anyhow::bail!("{} is not a git repository", path.display());
    };
    let repos = store
        .call(move |s| s.merge_discovered(vec![discovered]))
        .await
        .context("Failed to register repository")?;
    repos
        .into_iter()
        .find(|r| r.root_path == path)
        .with_context(|| format!("Repository {} missing after merge", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{configure_identity, git, repo_with_origin};
    use crate::models::RepoPatch;
    use crate::store::JsonStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_discover_skips_plain_directories() {
        let dir = tempdir().unwrap();
        repo_with_origin(dir.path(), "web");
        std::fs::create_dir_all(dir.path().join("repos/notes")).unwrap();
        std::fs::write(dir.path().join("repos/README.txt"), "x").unwrap();

        let found = discover_repos(&Git::new("git"), &dir.path().join("repos"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "web");
        assert_eq!(found[0].main_branch, "main");
        // A local bare origin is not a GitHub remote.
        assert_eq!(found[0].github_repo, None);
    }

    #[tokio::test]
    async fn test_discover_reads_github_origin_and_master() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repos/api");
        std::fs::create_dir_all(&root).unwrap();
        git(&root, &["init", "-b", "master"]);
        configure_identity(&root);
        std::fs::write(root.join("a.txt"), "a").unwrap();
        git(&root, &["add", "-A"]);
        git(&root, &["commit", "-m", "init"]);
        git(&root, &["remote", "add", "origin", "git@github.com:acme/api.git"]);

        let found = inspect_repo(&Git::new("git"), &root).await.unwrap().unwrap();
        assert_eq!(found.github_repo.as_deref(), Some("acme/api"));
        assert_eq!(found.main_branch, "master");
    }

    #[tokio::test]
    async fn test_missing_repos_dir_is_empty() {
        let dir = tempdir().unwrap();
        let found = discover_repos(&Git::new("git"), &dir.path().join("nope"))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_rescan_keeps_user_settings() {
        let dir = tempdir().unwrap();
        repo_with_origin(dir.path(), "web");
        let store = StoreHandle::new(JsonStore::open(&dir.path().join("state")).unwrap());
        let git = Git::new("git");
        let repos_dir = dir.path().join("repos");

        let repos = rescan(&store, &git, &repos_dir).await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].id, "web");
        store
            .blocking()
            .patch_repo(
                "web",
                RepoPatch {
                    enabled: Some(false),
                    test_command: Some("make check".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let repos = rescan(&store, &git, &repos_dir).await.unwrap();
        assert_eq!(repos.len(), 1);
        assert!(!repos[0].enabled);
        assert_eq!(repos[0].test_command, "make check");
    }

    #[tokio::test]
    async fn test_add_repo_rejects_non_git_directory() {
        let dir = tempdir().unwrap();
        let store = StoreHandle::new(JsonStore::open(&dir.path().join("state")).unwrap());
        let plain = dir.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();

        let err = add_repo(&store, &Git::new("git"), &plain).await.unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }
}
