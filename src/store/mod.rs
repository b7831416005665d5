//! File-backed durable store: repositories, tasks, runs and notifications as
//! JSON arrays under the state directory, plus the per-task event log.
//!
//! | File                         | Contents                   |
//! |------------------------------|----------------------------|
//! | `repos.json`                 | `RepoConfig` records       |
//! | `tasks.json`                 | `Task` records             |
//! | `runs.json`                  | `TaskRun` records          |
//! | `notifications.json`         | `Notification` records     |
//! | `events/<task_id>.ndjson`    | append-only event log      |
//! | `locks/<collection>.lock`    | advisory write locks       |
//!
//! Every mutation is a locked read-modify-write of one whole collection, so
//! the store can be shared by concurrent workers and by other processes
//! (for example a CLI invocation next to a running service).

mod actions;
mod collection;
mod runs;
mod tasks;

pub use actions::{BatchCounts, BatchFailure, BatchOutcome, CancelOutcome, MAX_BATCH_SIZE, normalize_task_ids};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use crate::errors::StoreError;
use crate::events::{EventBatch, EventKind, EventLog};
use crate::ids::{IdGenerator, IdKind};
use crate::models::{
    BoardColumn, BoardView, ColumnView, DiscoveredRepo, Notification, NotificationKind,
    RepoConfig, RepoPatch, Task, TaskRun,
};
use crate::util::{slugify, truncate_chars};
use collection::{Collection, Commit};

pub const NOTIFICATION_BODY_LIMIT: usize = 500;

pub struct JsonStore {
    state_dir: PathBuf,
    repos: Collection<RepoConfig>,
    tasks: Collection<Task>,
    runs: Collection<TaskRun>,
    notifications: Collection<Notification>,
    events: EventLog,
    ids: IdGenerator,
}

impl JsonStore {
    /// Open (or create) a store rooted at `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
        let store = Self {
            state_dir: state_dir.to_path_buf(),
            repos: Collection::open(state_dir, "repos")?,
            tasks: Collection::open(state_dir, "tasks")?,
            runs: Collection::open(state_dir, "runs")?,
            notifications: Collection::open(state_dir, "notifications")?,
            events: EventLog::open(&state_dir.join("events"))?,
            ids: IdGenerator::new(),
        };
        store.seed_ids()?;
        Ok(store)
    }

    fn seed_ids(&self) -> Result<(), StoreError> {
        for task in self.tasks.read()? {
            self.ids.observe(IdKind::Task, &task.id);
        }
        for run in self.runs.read()? {
            self.ids.observe(IdKind::Run, &run.id);
        }
        for notification in self.notifications.read()? {
            self.ids.observe(IdKind::Notification, &notification.id);
        }
        Ok(())
    }

    /// Allocate an id of `kind` that `taken` does not already contain.
    fn allocate_id(&self, kind: IdKind, taken: impl Fn(&str) -> bool) -> String {
        loop {
            let id = self.ids.next_id(kind, Utc::now());
            if !taken(&id) {
                return id;
            }
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn append_event(&self, task_id: &str, kind: EventKind) -> Result<u64, StoreError> {
        Ok(self.events.append(task_id, kind)?)
    }

    pub fn read_events(
        &self,
        task_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<EventBatch, StoreError> {
        Ok(self.events.read(task_id, cursor, limit)?)
    }

    // ── Repositories ────────────────────────────────────────────────

    pub fn list_repos(&self) -> Result<Vec<RepoConfig>, StoreError> {
        let mut repos = self.repos.read()?;
        repos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repos)
    }

    pub fn get_repo(&self, id: &str) -> Result<Option<RepoConfig>, StoreError> {
        Ok(self.repos.read()?.into_iter().find(|r| r.id == id))
    }

    /// Insert a repository or replace the one with the same id.
    pub fn upsert_repo(&self, repo: RepoConfig) -> Result<RepoConfig, StoreError> {
        if repo.id.trim().is_empty() {
            return Err(StoreError::InvalidInput("repository id is empty".into()));
        }
        self.repos.update(|repos| {
            match repos.iter_mut().find(|r| r.id == repo.id) {
                Some(existing) => *existing = repo.clone(),
                None => repos.push(repo.clone()),
            }
            Ok::<_, StoreError>(Commit::Write(repo))
        })
    }

    pub fn patch_repo(&self, id: &str, patch: RepoPatch) -> Result<RepoConfig, StoreError> {
        self.repos.update(|repos| {
            let repo = repos
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::RepoNotFound { id: id.to_string() })?;
            if let Some(enabled) = patch.enabled {
                repo.enabled = enabled;
            }
            if let Some(test_command) = patch.test_command {
                repo.test_command = test_command;
            }
            if let Some(main_branch) = patch.main_branch {
                repo.main_branch = main_branch;
            }
            if let Some(github_repo) = patch.github_repo {
                repo.github_repo = (!github_repo.trim().is_empty()).then_some(github_repo);
            }
            Ok(Commit::Write(repo.clone()))
        })
    }

    /// Merge freshly discovered repositories, matched by root path. New ones
    /// get a slug id that does not clash with an existing one; known ones
    /// keep user settings and only get a missing remote filled in.
    pub fn merge_discovered(
        &self,
        found: Vec<DiscoveredRepo>,
    ) -> Result<Vec<RepoConfig>, StoreError> {
        self.repos.update(|repos| {
            let mut changed = false;
            for discovered in found {
                if let Some(existing) = repos
                    .iter_mut()
                    .find(|r| r.root_path == discovered.root_path)
                {
                    if existing.remote().is_none() && discovered.github_repo.is_some() {
                        existing.github_repo = discovered.github_repo;
                        changed = true;
                    }
                    continue;
                }

                let base = Some(slugify(&discovered.name, 48))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "repo".to_string());
                let mut id = base.clone();
                let mut n = 1;
                while repos.iter().any(|r| r.id == id) {
                    n += 1;
                    id = format!("{base}-{n}");
                }
                let mut repo = RepoConfig::new(&id, &discovered.name, discovered.root_path);
                repo.main_branch = discovered.main_branch;
                repo.github_repo = discovered.github_repo;
                repos.push(repo);
                changed = true;
            }
            repos.sort_by(|a, b| a.id.cmp(&b.id));
            Ok::<_, StoreError>(if changed {
                Commit::Write(repos.clone())
            } else {
                Commit::Skip(repos.clone())
            })
        })
    }

    // ── Notifications ───────────────────────────────────────────────

    pub fn create_notification(
        &self,
        task_id: &str,
        kind: NotificationKind,
        title: &str,
        body: &str,
    ) -> Result<Notification, StoreError> {
        self.notifications.update(|rows| {
            let id = self.allocate_id(IdKind::Notification, |id| rows.iter().any(|n| n.id == id));
            let notification = Notification {
                id,
                task_id: task_id.to_string(),
                kind,
                title: title.to_string(),
                body: truncate_chars(body, NOTIFICATION_BODY_LIMIT),
                created_at: Utc::now(),
                read: false,
            };
            rows.push(notification.clone());
            Ok::<_, StoreError>(Commit::Write(notification))
        })
    }

    /// Newest first.
    pub fn list_notifications(
        &self,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut rows: Vec<_> = self
            .notifications
            .read()?
            .into_iter()
            .filter(|n| !unread_only || !n.read)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Mark one notification (or all, when `id` is `None`) as read. Returns
    /// the number of notifications changed.
    pub fn mark_notifications_read(&self, id: Option<&str>) -> Result<usize, StoreError> {
        self.notifications.update(|rows| {
            let mut changed = 0;
            for n in rows.iter_mut().filter(|n| !n.read) {
                if id.is_none_or(|id| n.id == id) {
                    n.read = true;
                    changed += 1;
                }
            }
            Ok::<_, StoreError>(if changed > 0 {
                Commit::Write(changed)
            } else {
                Commit::Skip(changed)
            })
        })
    }

    // ── Board ───────────────────────────────────────────────────────

    /// Tasks grouped into display columns, highest priority first.
    pub fn board(&self, repo_id: Option<&str>) -> Result<BoardView, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()?
            .into_iter()
            .filter(|t| repo_id.is_none_or(|r| t.repo_id == r))
            .collect();
        tasks.sort_by(tasks::queue_order);

        let columns = BoardColumn::ALL
            .iter()
            .map(|column| {
                let tasks: Vec<Task> = tasks
                    .iter()
                    .filter(|t| BoardColumn::for_status(t.status) == *column)
                    .cloned()
                    .collect();
                ColumnView {
                    column: *column,
                    count: tasks.len(),
                    tasks,
                }
            })
            .collect();
        Ok(BoardView { columns })
    }
}

/// Shared, cloneable handle that runs store operations on tokio's blocking
/// pool so file I/O and lock waits never stall async workers.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<JsonStore>,
}

impl StoreHandle {
    pub fn new(store: JsonStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(JsonStore::open(state_dir)?))
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&JsonStore) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("Store task panicked: {e}")))?
    }

    /// Direct synchronous access. For startup, CLI commands and tests; never
    /// from a hot async path.
    pub fn blocking(&self) -> &JsonStore {
        &self.inner
    }
}
