//! Worktree cleanup for a task's run, recorded as `worktree_cleanup` events.
//!
//! Used when an attempt ends in FAILED or CANCELLED, when a reviewed task is
//! marked done, when a queued task is cancelled and when interrupted runs
//! are recovered at startup. A failed cleanup never changes the task status;
//! the event tells the operator that a stray worktree may be left behind.

use tracing::{info, warn};

use crate::errors::StoreError;
use crate::events::{CleanupResult, EventKind};
use crate::git::GitPipeline;
use crate::models::{Task, TaskRun, TaskStatus};
use crate::store::StoreHandle;

#[derive(Debug, Default)]
struct Record {
    run_id: Option<String>,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    failed_step: Option<String>,
    error_message: Option<String>,
}

impl Record {
    fn for_run(run: &TaskRun) -> Self {
        Self {
            run_id: Some(run.id.clone()),
            worktree_path: run.worktree_path.as_ref().map(|p| p.display().to_string()),
            branch_name: run.branch_name.clone(),
            ..Default::default()
        }
    }
}

async fn emit(
    store: &StoreHandle,
    task_id: &str,
    trigger_status: TaskStatus,
    result: CleanupResult,
    record: Record,
) {
    let id = task_id.to_string();
    let event = EventKind::WorktreeCleanup {
        trigger_status,
        result,
        run_id: record.run_id,
        worktree_path: record.worktree_path,
        branch_name: record.branch_name,
        failed_step: record.failed_step,
        error_message: record.error_message,
    };
    if let Err(e) = store.call(move |s| s.append_event(&id, event)).await {
        warn!(task_id, error = %e, "Failed to record cleanup event");
    }
}

/// Record a cleanup outcome that involved no git work, such as a run
/// without a worktree.
pub async fn record_cleanup(
    store: &StoreHandle,
    task_id: &str,
    trigger_status: TaskStatus,
    result: CleanupResult,
    run_id: Option<&str>,
) {
    let record = Record {
        run_id: run_id.map(str::to_string),
        ..Default::default()
    };
    emit(store, task_id, trigger_status, result, record).await;
}

/// Remove the worktree and branch recorded on `run`, then clear the run's
/// `worktree_path` on success.
pub async fn cleanup_run(
    store: &StoreHandle,
    pipeline: &GitPipeline,
    task: &Task,
    run: &TaskRun,
    trigger_status: TaskStatus,
) -> CleanupResult {
    let mut record = Record::for_run(run);
    let Some(path) = run.worktree_path.clone() else {
        emit(store, &task.id, trigger_status, CleanupResult::SkipEmptyPath, record).await;
        return CleanupResult::SkipEmptyPath;
    };

    let repo_id = task.repo_id.clone();
    let repo = match store.call(move |s| s.get_repo(&repo_id)).await {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            warn!(task_id = %task.id, repo_id = %task.repo_id, "Cleanup skipped, repository not found");
            emit(store, &task.id, trigger_status, CleanupResult::RepoNotFound, record).await;
            return CleanupResult::RepoNotFound;
        }
        Err(e) => {
            record.error_message = Some(e.to_string());
            emit(store, &task.id, trigger_status, CleanupResult::Failed, record).await;
            return CleanupResult::Failed;
        }
    };

    match pipeline
        .cleanup(&repo, &path, run.branch_name.as_deref())
        .await
    {
        Ok(()) => {
            info!(task_id = %task.id, run_id = %run.id, path = %path.display(), "Worktree cleaned up");
            let run_id = run.id.clone();
            if let Err(e) = store
                .call(move |s| s.update_run(&run_id, |r| r.worktree_path = None))
                .await
            {
                warn!(task_id = %task.id, error = %e, "Failed to clear run worktree path");
            }
            emit(store, &task.id, trigger_status, CleanupResult::Success, record).await;
            CleanupResult::Success
        }
        Err((step, e)) => {
            warn!(task_id = %task.id, run_id = %run.id, step = step.as_str(), error = %e, "Worktree cleanup failed");
            record.failed_step = Some(step.as_str().to_string());
            record.error_message = Some(e.to_string());
            emit(store, &task.id, trigger_status, CleanupResult::Failed, record).await;
            CleanupResult::Failed
        }
    }
}

/// Clean up the worktree of the task's current run, if it has one.
pub async fn cleanup_current_run(
    store: &StoreHandle,
    pipeline: &GitPipeline,
    task: &Task,
    trigger_status: TaskStatus,
) -> CleanupResult {
    let Some(run_id) = task.current_run_id.clone() else {
        emit(store, &task.id, trigger_status, CleanupResult::SkipNoCurrentRun, Record::default()).await;
        return CleanupResult::SkipNoCurrentRun;
    };
    let lookup = run_id.clone();
    match store
        .call(move |s| Ok::<_, StoreError>(s.get_run(&lookup)?))
        .await
    {
        Ok(Some(run)) => cleanup_run(store, pipeline, task, &run, trigger_status).await,
        Ok(None) => {
            let record = Record {
                run_id: Some(run_id),
                ..Default::default()
            };
            emit(store, &task.id, trigger_status, CleanupResult::RunNotFound, record).await;
            CleanupResult::RunNotFound
        }
        Err(e) => {
            let record = Record {
                run_id: Some(run_id),
                error_message: Some(e.to_string()),
                ..Default::default()
            };
            emit(store, &task.id, trigger_status, CleanupResult::Failed, record).await;
            CleanupResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::repo_with_origin;
    use crate::models::{NewTask, RepoConfig, TaskMode};
    use crate::store::JsonStore;
    use crate::testing::settings;
    use tempfile::tempdir;

    fn cleanup_results(store: &StoreHandle, task_id: &str) -> Vec<CleanupResult> {
        store
            .blocking()
            .events()
            .read_all(task_id)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::WorktreeCleanup { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_cleanup_current_run_removes_worktree_once() {
        let dir = tempdir().unwrap();
        let root = repo_with_origin(dir.path(), "web");
        let settings = settings(dir.path());
        let store = StoreHandle::new(JsonStore::open(&settings.state_dir).unwrap());
        store
            .blocking()
            .upsert_repo(RepoConfig::new("web", "web", root))
            .unwrap();
        let pipeline = GitPipeline::new(&settings);

        let task = store
            .blocking()
            .create_task(NewTask::new("web", "Fix login", "p", TaskMode::Exec))
            .unwrap();
        let repo = store.blocking().get_repo("web").unwrap().unwrap();
        let worktree = pipeline.create_worktree(&repo, &task).await.unwrap();
        let run = store.blocking().create_run(&task.id, "worker-0").unwrap();
        let (path, branch) = (worktree.path.clone(), worktree.branch.clone());
        store
            .blocking()
            .update_run(&run.id, move |r| {
                r.worktree_path = Some(path);
                r.branch_name = Some(branch);
            })
            .unwrap();
        let task = store.blocking().require_task(&task.id).unwrap();

        let first = cleanup_current_run(&store, &pipeline, &task, TaskStatus::Done).await;
        assert_eq!(first, CleanupResult::Success);
        assert!(!worktree.path.exists());
        assert!(store.blocking().get_run(&run.id).unwrap().unwrap().worktree_path.is_none());

        let second = cleanup_current_run(&store, &pipeline, &task, TaskStatus::Done).await;
        assert_eq!(second, CleanupResult::SkipEmptyPath);
        assert_eq!(
            cleanup_results(&store, &task.id),
            vec![CleanupResult::Success, CleanupResult::SkipEmptyPath]
        );
    }

    #[tokio::test]
    async fn test_cleanup_without_run_is_recorded() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = StoreHandle::new(crate::store::tests::store_with_repo(dir.path()));
        let pipeline = GitPipeline::new(&settings);
        let mut task = store
            .blocking()
            .create_task(NewTask::new("web", "t", "p", TaskMode::Exec))
            .unwrap();

        let result = cleanup_current_run(&store, &pipeline, &task, TaskStatus::Cancelled).await;
        assert_eq!(result, CleanupResult::SkipNoCurrentRun);

        task.current_run_id = Some("missing-run".into());
        let result = cleanup_current_run(&store, &pipeline, &task, TaskStatus::Cancelled).await;
        assert_eq!(result, CleanupResult::RunNotFound);
    }
}
