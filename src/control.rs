//! Human decisions on tasks.
//!
//! Status changes go through the store's transition primitive; this layer
//! adds what happens around them: the in-process cancel signal for running
//! attempts, worktree cleanup when a task leaves the board, and
//! notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::ActionError;
use crate::git::GitPipeline;
use crate::models::{NotificationKind, Task, TaskMode, TaskStatus};
use crate::runner::{TaskRunner, cleanup_current_run};
use crate::store::{BatchOutcome, CancelOutcome, StoreHandle};

#[derive(Clone)]
pub struct Control {
    store: StoreHandle,
    pipeline: GitPipeline,
    runner: Option<Arc<dyn TaskRunner>>,
}

impl Control {
    /// `runner` is the in-process runner, if this process executes tasks.
    /// Without one, running tasks are stopped through their cancel flag only.
    pub fn new(store: StoreHandle, pipeline: GitPipeline, runner: Option<Arc<dyn TaskRunner>>) -> Self {
        Self {
            store,
            pipeline,
            runner,
        }
    }

    async fn notify(&self, task: &Task, kind: NotificationKind, title: String) {
        let id = task.id.clone();
        if let Err(e) = self
            .store
            .call(move |s| s.create_notification(&id, kind, &title, ""))
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to create notification");
        }
    }

    pub async fn confirm(
        &self,
        task_id: &str,
        answers: BTreeMap<String, String>,
    ) -> Result<Task, ActionError> {
        let id = task_id.to_string();
        let task = self
            .store
            .call(move |s| s.confirm_plan(&id, &answers))
            .await?;
        info!(task_id, "Plan confirmed");
        Ok(task)
    }

    pub async fn revise(&self, task_id: &str, feedback: &str) -> Result<Task, ActionError> {
        let (id, feedback) = (task_id.to_string(), feedback.to_string());
        let task = self
            .store
            .call(move |s| s.revise_plan(&id, &feedback))
            .await?;
        info!(task_id, "Plan sent back for revision");
        Ok(task)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome, ActionError> {
        let id = task_id.to_string();
        let outcome = self.store.call(move |s| s.cancel_task(&id)).await?;
        match &outcome {
            CancelOutcome::Cancelled(task) => {
                info!(task_id, "Queued task cancelled");
                cleanup_current_run(&self.store, &self.pipeline, task, TaskStatus::Cancelled).await;
                self.notify(task, NotificationKind::Info, format!("Task cancelled: {}", task.title))
                    .await;
            }
            CancelOutcome::Requested(_) => {
                let signalled = match &self.runner {
                    Some(runner) => runner.cancel(task_id).await,
                    None => false,
                };
                info!(task_id, signalled, "Cancel requested for running task");
            }
        }
        Ok(outcome)
    }

    pub async fn mark_done(&self, task_id: &str) -> Result<Task, ActionError> {
        let id = task_id.to_string();
        let task = self.store.call(move |s| s.mark_done(&id)).await?;
        info!(task_id, "Task marked done");
        cleanup_current_run(&self.store, &self.pipeline, &task, TaskStatus::Done).await;
        self.notify(&task, NotificationKind::Success, format!("Task done: {}", task.title))
            .await;
        Ok(task)
    }

    pub async fn retry(&self, task_id: &str, reset_mode: Option<TaskMode>) -> Result<Task, ActionError> {
        let id = task_id.to_string();
        let task = self
            .store
            .call(move |s| s.retry_task(&id, reset_mode))
            .await?;
        info!(task_id, mode = %task.mode, "Task queued for retry");
        Ok(task)
    }

    pub async fn batch_confirm(&self, task_ids: Vec<String>) -> Result<BatchOutcome, ActionError> {
        let outcome = self.store.call(move |s| s.batch_confirm(&task_ids)).await?;
        info!(updated = outcome.updated.len(), failed = outcome.failed.len(), "Batch confirm finished");
        Ok(outcome)
    }

    pub async fn batch_revise(
        &self,
        task_ids: Vec<String>,
        feedback: &str,
    ) -> Result<BatchOutcome, ActionError> {
        let feedback = feedback.to_string();
        let outcome = self
            .store
            .call(move |s| s.batch_revise(&task_ids, &feedback))
            .await?;
        info!(updated = outcome.updated.len(), failed = outcome.failed.len(), "Batch revise finished");
        Ok(outcome)
    }
}
