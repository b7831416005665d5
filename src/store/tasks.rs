use std::cmp::Ordering;

use chrono::Utc;
use tracing::debug;

use super::JsonStore;
use super::collection::Commit;
use crate::errors::StoreError;
use crate::ids::IdKind;
use crate::models::{NewTask, Task, TaskFilter, TaskMode, TaskStatus};
use crate::state_machine::{claim_target, is_claimable, is_valid_transition};

/// Queue order: higher priority first, then oldest first.
pub(crate) fn queue_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

impl JsonStore {
    pub fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidInput("title is required".into()));
        }
        if new.prompt.trim().is_empty() {
            return Err(StoreError::InvalidInput("prompt is required".into()));
        }
        let repo = self
            .get_repo(&new.repo_id)?
            .ok_or_else(|| StoreError::RepoNotFound {
                id: new.repo_id.clone(),
            })?;
        if !repo.enabled {
            return Err(StoreError::RepoDisabled { id: repo.id });
        }

        self.tasks.update(|tasks| {
            let id = self.allocate_id(IdKind::Task, |id| tasks.iter().any(|t| t.id == id));
            let now = Utc::now();
            let task = Task {
                id,
                repo_id: new.repo_id,
                title: title.to_string(),
                prompt: new.prompt,
                mode: new.mode,
                status: TaskStatus::Todo,
                permission_mode: new.permission_mode,
                priority: new.priority,
                created_at: now,
                updated_at: now,
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
            };
            tasks.push(task.clone());
            Ok::<_, StoreError>(Commit::Write(task))
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read()?.into_iter().find(|t| t.id == id))
    }

    pub fn require_task(&self, id: &str) -> Result<Task, StoreError> {
        self.get_task(id)?
            .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })
    }

    /// Matching tasks in queue order.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(queue_order);
        Ok(tasks)
    }

    /// Update non-status fields of a task. Status changes must go through
    /// `apply_transition`.
    pub fn update_task<F>(&self, id: &str, mutator: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        self.tasks.update(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })?;
            let before = task.status;
            mutator(task);
            if task.status != before {
                return Err(StoreError::InvalidTransition {
                    mode: task.mode,
                    from: before,
                    to: task.status,
                });
            }
            task.updated_at = Utc::now();
            Ok(Commit::Write(task.clone()))
        })
    }

    /// Move a task from `expected` to `new_status`, applying `mutator` in the
    /// same locked write. Fails with `Conflict` if the task is no longer in
    /// `expected`, and with `InvalidTransition` if the move is not legal for
    /// the task's mode. Nothing is written when the mutator fails.
    pub fn apply_transition<F, E>(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new_status: TaskStatus,
        mutator: F,
    ) -> Result<Task, E>
    where
        F: FnOnce(&mut Task) -> Result<(), E>,
        E: From<StoreError>,
    {
        self.tasks.update(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| StoreError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            if task.status != expected {
                return Err(StoreError::Conflict {
                    id: task_id.to_string(),
                    expected,
                    actual: task.status,
                }
                .into());
            }
            if !is_valid_transition(task.mode, expected, new_status) {
                return Err(StoreError::InvalidTransition {
                    mode: task.mode,
                    from: expected,
                    to: new_status,
                }
                .into());
            }

            let mut updated = task.clone();
            mutator(&mut updated)?;
            updated.id = task.id.clone();
            updated.status = new_status;
            updated.updated_at = Utc::now();
            *task = updated.clone();
            debug!(task_id, from = %expected, to = %new_status, "Task transition");
            Ok(Commit::Write(updated))
        })
    }

    /// Atomically claim the best eligible task for `worker_id`, moving it to
    /// its running status. `mode_filter` restricts the claim to one mode.
    pub fn claim_next_task(
        &self,
        worker_id: &str,
        mode_filter: Option<TaskMode>,
    ) -> Result<Option<Task>, StoreError> {
        self.tasks.update(|tasks| {
            let repos = self.repos.read()?;
            let enabled = |repo_id: &str| repos.iter().any(|r| r.id == repo_id && r.enabled);

            let best = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| mode_filter.is_none_or(|m| t.mode == m))
                .filter(|(_, t)| is_claimable(t.mode, t.status))
                .filter(|(_, t)| !t.cancel_requested)
                .filter(|(_, t)| enabled(&t.repo_id))
                .min_by(|(_, a), (_, b)| queue_order(a, b))
                .map(|(idx, _)| idx);

            let Some(idx) = best else {
                return Ok(Commit::Skip(None));
            };
            let task = &mut tasks[idx];
            task.status = claim_target(task.mode);
            task.worker_id = Some(worker_id.to_string());
            task.updated_at = Utc::now();
            debug!(task_id = %task.id, worker_id, status = %task.status, "Task claimed");
            Ok::<_, StoreError>(Commit::Write(Some(task.clone())))
        })
    }

    /// Tasks left in a running status, e.g. by a previous process that died.
    pub fn running_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()?
            .into_iter()
            .filter(|t| t.status.is_running())
            .collect())
    }

    /// Write a task verbatim, bypassing the state machine.
    #[cfg(test)]
    pub(crate) fn put_task(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.update(|tasks| {
            tasks.retain(|t| t.id != task.id);
            tasks.push(task);
            Ok::<_, StoreError>(Commit::Write(()))
        })
    }
}
