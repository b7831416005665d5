use chrono::Utc;
use tracing::warn;

use super::JsonStore;
use super::collection::Commit;
use crate::errors::StoreError;
use crate::ids::IdKind;
use crate::models::{ErrorCode, RunOutcome, TaskRun, TaskStatus};

impl JsonStore {
    /// Open a new attempt for `task_id` and make it the task's current run.
    /// Any run of the task still open is closed as interrupted first, so at
    /// most one run per task is ever open.
    pub fn create_run(&self, task_id: &str, worker_id: &str) -> Result<TaskRun, StoreError> {
        self.require_task(task_id)?;
        let run = self.runs.update(|runs| {
            let now = Utc::now();
            for stale in runs.iter_mut().filter(|r| r.task_id == task_id && r.is_open()) {
                warn!(task_id, run_id = %stale.id, "Closing stale open run");
                stale.ended_at = Some(now);
                stale.outcome = Some(RunOutcome {
                    status: TaskStatus::Failed,
                    error_code: Some(ErrorCode::Interrupted),
                });
            }
            let attempt = runs.iter().filter(|r| r.task_id == task_id).count() as u32 + 1;
            let id = self.allocate_id(IdKind::Run, |id| runs.iter().any(|r| r.id == id));
            let run = TaskRun {
                id,
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                attempt,
                started_at: now,
                ended_at: None,
                exit_code: None,
                worktree_path: None,
                branch_name: None,
                base_commit: None,
                commit_sha: None,
                outcome: None,
                metrics: Default::default(),
            };
            runs.push(run.clone());
            Ok::<_, StoreError>(Commit::Write(run))
        })?;

        let run_id = run.id.clone();
        self.update_task(task_id, move |t| t.current_run_id = Some(run_id))?;
        Ok(run)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<TaskRun>, StoreError> {
        Ok(self.runs.read()?.into_iter().find(|r| r.id == id))
    }

    /// Runs of a task, oldest attempt first.
    pub fn list_runs(&self, task_id: &str) -> Result<Vec<TaskRun>, StoreError> {
        let mut runs: Vec<TaskRun> = self
            .runs
            .read()?
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect();
        runs.sort_by_key(|r| r.attempt);
        Ok(runs)
    }

    pub fn update_run<F>(&self, id: &str, mutator: F) -> Result<TaskRun, StoreError>
    where
        F: FnOnce(&mut TaskRun),
    {
        self.runs.update(|runs| {
            let run = runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
            mutator(run);
            Ok(Commit::Write(run.clone()))
        })
    }

    /// Close a run with its outcome. Closing an already closed run keeps the
    /// first outcome.
    pub fn finish_run(
        &self,
        id: &str,
        exit_code: Option<i32>,
        outcome: RunOutcome,
    ) -> Result<TaskRun, StoreError> {
        self.runs.update(|runs| {
            let run = runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
            if !run.is_open() {
                return Ok(Commit::Skip(run.clone()));
            }
            run.ended_at = Some(Utc::now());
            if exit_code.is_some() {
                run.exit_code = exit_code;
            }
            run.outcome = Some(outcome);
            Ok(Commit::Write(run.clone()))
        })
    }
}
