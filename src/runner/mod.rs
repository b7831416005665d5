//! Execution of claimed tasks.
//!
//! `AgentRunner` owns one attempt of a task from claim to terminal status:
//!
//! | Mode | Flow                                                            |
//! |------|-----------------------------------------------------------------|
//! | PLAN | agent in the repository root → plan parser → `PLAN_REVIEW`      |
//! | EXEC | worktree → agent → commit → rebase → test → push → PR → `REVIEW` |
//!
//! Every FAILED or CANCELLED exec attempt snapshots its worktree into the
//! artifacts directory and then removes it, before the terminal status is
//! written. The scheduler only talks to the `TaskRunner` trait, so tests can
//! substitute a mock.

mod cleanup;
mod exec;
mod plan;

pub use cleanup::{cleanup_current_run, cleanup_run, record_cleanup};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentOutcome, AgentSupervisor};
use crate::config::Settings;
use crate::errors::{GitError, StoreError};
use crate::events::{CleanupResult, EventKind};
use crate::git::GitPipeline;
use crate::models::{
    ErrorCode, FailureReason, NotificationKind, PlanResult, RepoConfig, RunOutcome, Task,
    TaskMode, TaskRun, TaskStatus,
};
use crate::store::StoreHandle;

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Drive a claimed task (status PLAN_RUNNING or RUNNING) to its next
    /// resting status.
    async fn run_task(&self, task: Task, worker_id: &str) -> Result<()>;

    /// Signal the in-process attempt of `task_id`. Returns false when this
    /// runner is not executing the task.
    async fn cancel(&self, task_id: &str) -> bool;

    /// Stop every in-flight attempt for a service shutdown. Attempts end
    /// `FAILED` with `INTERRUPTED` unless a user cancel was already pending.
    async fn interrupt_all(&self);

    /// Fail a task left in a running status by an attempt that died,
    /// releasing its workspace first.
    async fn recover(&self, task_id: &str, code: ErrorCode, message: &str) -> Result<()>;
}

/// How an attempt ended.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    status: TaskStatus,
    error_code: Option<ErrorCode>,
    failure_reason: Option<FailureReason>,
    message: Option<String>,
    exit_code: Option<i32>,
    plan_result: Option<PlanResult>,
    pr_url: Option<String>,
}

impl Resolution {
    fn new(status: TaskStatus) -> Self {
        Self {
            status,
            error_code: None,
            failure_reason: None,
            message: None,
            exit_code: None,
            plan_result: None,
            pr_url: None,
        }
    }

    pub(crate) fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            message: Some(message.into()),
            ..Self::new(TaskStatus::Failed)
        }
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Self {
        Self {
            error_code: Some(ErrorCode::Cancelled),
            message: Some(message.into()),
            ..Self::new(TaskStatus::Cancelled)
        }
    }

    fn plan_review(plan: PlanResult) -> Self {
        Self {
            plan_result: Some(plan),
            ..Self::new(TaskStatus::PlanReview)
        }
    }

    fn review(pr_url: Option<String>) -> Self {
        Self {
            pr_url,
            ..Self::new(TaskStatus::Review)
        }
    }

    /// `GIT_PIPELINE_FAILED` with the stage named by the error.
    fn pipeline(err: &GitError) -> Self {
        Self {
            failure_reason: err.reason(),
            ..Self::failed(ErrorCode::GitPipelineFailed, err.to_string())
        }
    }

    fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    fn releases_workspace(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    fn apply(self, task: &mut Task) {
        task.error_code = self.error_code;
        task.failure_reason = self.failure_reason;
        task.error_message = self.message;
        task.cancel_requested = false;
        if let Some(plan) = self.plan_result {
            task.plan_result = Some(plan);
        }
        if self.pr_url.is_some() {
            task.pr_url = self.pr_url;
        }
    }
}

/// Terminal outcome of an agent attempt that did not finish cleanly.
fn agent_failure(outcome: &AgentOutcome, nonzero: ErrorCode, phase: &str) -> Option<Resolution> {
    let resolution = if outcome.cancelled {
        Resolution::cancelled(format!("Cancelled during {phase}"))
    } else if outcome.timed_out {
        Resolution::failed(ErrorCode::Timeout, format!("Agent timed out during {phase}"))
    } else if outcome.resume_failed {
        Resolution::failed(
            ErrorCode::SessionResumeFailed,
            format!(
                "Agent session could not be resumed and the fallback session exited with code {}",
                outcome.exit_code
            ),
        )
    } else if outcome.exit_code != 0 {
        Resolution::failed(nonzero, format!("Agent exited with code {}", outcome.exit_code))
    } else {
        return None;
    };
    Some(resolution.with_exit_code(outcome.exit_code))
}

/// One attempt in progress.
pub(crate) struct Attempt {
    task: Task,
    run: TaskRun,
    cancel: CancellationToken,
    /// Output of the TEST stage, kept for the failure snapshot.
    test_output: Option<String>,
}

/// Cancellation handle of an attempt owned by this runner.
struct RunningAttempt {
    token: CancellationToken,
    user_cancelled: bool,
}

#[derive(Clone)]
pub struct AgentRunner {
    store: StoreHandle,
    pipeline: GitPipeline,
    agent: AgentSupervisor,
    running: Arc<Mutex<HashMap<String, RunningAttempt>>>,
    /// Parent of every attempt token; cancelled once on shutdown.
    shutdown: CancellationToken,
}

impl AgentRunner {
    pub fn new(store: StoreHandle, settings: &Settings) -> Self {
        Self {
            agent: AgentSupervisor::new(store.clone(), settings),
            pipeline: GitPipeline::new(settings),
            store,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &GitPipeline {
        &self.pipeline
    }

    /// Ids of the tasks this runner is executing.
    pub async fn running_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn emit(&self, task_id: &str, kind: EventKind) {
        let id = task_id.to_string();
        if let Err(e) = self.store.call(move |s| s.append_event(&id, kind)).await {
            warn!(task_id, error = %e, "Failed to append event");
        }
    }

    async fn notify(&self, task_id: &str, kind: NotificationKind, title: String, body: String) {
        let id = task_id.to_string();
        if let Err(e) = self
            .store
            .call(move |s| s.create_notification(&id, kind, &title, &body))
            .await
        {
            warn!(task_id, error = %e, "Failed to create notification");
        }
    }

    async fn repo(&self, repo_id: &str) -> Result<Option<RepoConfig>> {
        let id = repo_id.to_string();
        Ok(self.store.call(move |s| s.get_repo(&id)).await?)
    }

    async fn cancel_requested(&self, attempt: &Attempt) -> bool {
        if attempt.cancel.is_cancelled() {
            return true;
        }
        let id = attempt.task.id.clone();
        self.store
            .call(move |s| Ok::<_, StoreError>(s.get_task(&id)?.is_some_and(|t| t.cancel_requested)))
            .await
            .unwrap_or_else(|e| {
                warn!(task_id = %attempt.task.id, error = %e, "Failed to read cancel flag");
                false
            })
    }

    async fn run_attempt(&self, task: Task, worker_id: &str, cancel: CancellationToken) -> Result<()> {
        let task_id = task.id.clone();
        let worker = worker_id.to_string();
        let run = self
            .store
            .call(move |s| s.create_run(&task_id, &worker))
            .await
            .context("Failed to open run")?;
        info!(task_id = %task.id, run_id = %run.id, worker_id, mode = %task.mode, attempt = run.attempt, "Attempt started");

        let mut attempt = Attempt {
            task,
            run,
            cancel,
            test_output: None,
        };
        let resolution = match attempt.task.mode {
            TaskMode::Plan => self.run_plan(&mut attempt).await,
            TaskMode::Exec => self.run_exec(&mut attempt).await,
        }
        .unwrap_or_else(|e| {
            error!(task_id = %attempt.task.id, run_id = %attempt.run.id, error = ?e, "Unexpected runner error");
            Resolution::failed(ErrorCode::UnexpectedError, format!("{e:#}"))
        });
        let resolution = self.unless_shutdown(&attempt.task.id, resolution).await;

        self.finalize(
            &attempt.task,
            Some(&attempt.run),
            attempt.test_output.as_deref(),
            resolution,
        )
        .await
        .map(|_| ())
    }

    /// A cancellation caused by shutdown rather than by a user becomes
    /// `FAILED(INTERRUPTED)`.
    async fn unless_shutdown(&self, task_id: &str, resolution: Resolution) -> Resolution {
        if resolution.status != TaskStatus::Cancelled || !self.shutdown.is_cancelled() {
            return resolution;
        }
        let signalled = self
            .running
            .lock()
            .await
            .get(task_id)
            .is_some_and(|a| a.user_cancelled);
        let id = task_id.to_string();
        let flagged = self
            .store
            .call(move |s| Ok::<_, StoreError>(s.get_task(&id)?.is_some_and(|t| t.cancel_requested)))
            .await
            .unwrap_or(false);
        if signalled || flagged {
            return resolution;
        }
        info!(task_id, "Attempt interrupted by shutdown");
        let interrupted =
            Resolution::failed(ErrorCode::Interrupted, "Interrupted by service shutdown");
        match resolution.exit_code {
            Some(code) => interrupted.with_exit_code(code),
            None => interrupted,
        }
    }

    /// Snapshot and remove the run's worktree, or record why nothing was removed.
    async fn release_workspace(
        &self,
        task: &Task,
        run: Option<&TaskRun>,
        test_output: Option<&str>,
        trigger: TaskStatus,
    ) {
        let Some(run) = run else {
            record_cleanup(&self.store, &task.id, trigger, CleanupResult::SkipNoCurrentRun, None).await;
            return;
        };
        let run_id = run.id.clone();
        let latest = match self.store.call(move |s| s.get_run(&run_id)).await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                record_cleanup(&self.store, &task.id, trigger, CleanupResult::RunNotFound, Some(&run.id)).await;
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to load run for cleanup");
                run.clone()
            }
        };
        let Some(worktree) = latest.worktree_path.clone() else {
            record_cleanup(&self.store, &task.id, trigger, CleanupResult::SkipEmptyPath, Some(&run.id)).await;
            return;
        };

        let events_log = self.store.blocking().events().path_for(&task.id);
        match self
            .pipeline
            .snapshot(
                &task.id,
                &latest.id,
                &worktree,
                latest.base_commit.as_deref(),
                &events_log,
                test_output,
            )
            .await
        {
            Ok(dir) => {
                let path = dir.display().to_string();
                self.emit(&task.id, EventKind::Artifact { path: path.clone() }).await;
                let run_id = latest.id.clone();
                if let Err(e) = self
                    .store
                    .call(move |s| {
                        s.update_run(&run_id, |r| {
                            r.metrics.insert("artifact_path".to_string(), json!(path));
                        })
                    })
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to record artifact path");
                }
            }
            Err(e) => warn!(task_id = %task.id, run_id = %latest.id, error = %e, "Artifact snapshot failed"),
        }

        cleanup_run(&self.store, &self.pipeline, task, &latest, trigger).await;
    }

    /// Release the workspace of a failed attempt, close the run, persist the
    /// task's new status and notify.
    async fn finalize(
        &self,
        task: &Task,
        run: Option<&TaskRun>,
        test_output: Option<&str>,
        resolution: Resolution,
    ) -> Result<Task> {
        let status = resolution.status;
        if resolution.releases_workspace() {
            self.release_workspace(task, run, test_output, status).await;
        }

        if let Some(run) = run {
            let run_id = run.id.clone();
            let outcome = RunOutcome {
                status,
                error_code: resolution.error_code,
            };
            let exit_code = resolution.exit_code;
            if let Err(e) = self
                .store
                .call(move |s| s.finish_run(&run_id, exit_code, outcome))
                .await
            {
                warn!(task_id = %task.id, run_id = %run.id, error = %e, "Failed to close run");
            }
        }

        let task_id = task.id.clone();
        let from = task.status;
        let applied = resolution.clone();
        let updated = self
            .store
            .call(move |s| {
                s.apply_transition(&task_id, from, status, |t| {
                    applied.apply(t);
                    Ok::<_, StoreError>(())
                })
            })
            .await
            .with_context(|| format!("Failed to move task {} to {status}", task.id))?;

        let message = resolution.message.clone().unwrap_or_default();
        match status {
            TaskStatus::PlanReview => {
                info!(task_id = %task.id, "Plan ready for review");
                self.notify(
                    &task.id,
                    NotificationKind::Info,
                    format!("Plan ready for review: {}", task.title),
                    "Confirm the plan options in the task to continue.".to_string(),
                )
                .await;
            }
            TaskStatus::Review => {
                info!(task_id = %task.id, pr_url = ?updated.pr_url, "Task ready for review");
                self.notify(
                    &task.id,
                    NotificationKind::Success,
                    format!("Task ready for review: {}", task.title),
                    updated.pr_url.clone().unwrap_or_default(),
                )
                .await;
            }
            TaskStatus::Cancelled => {
                info!(task_id = %task.id, "Task cancelled");
                self.notify(
                    &task.id,
                    NotificationKind::Info,
                    format!("Task cancelled: {}", task.title),
                    message,
                )
                .await;
            }
            _ => {
                warn!(task_id = %task.id, error_code = ?updated.error_code, reason = ?updated.failure_reason, message = %message, "Task failed");
                self.notify(
                    &task.id,
                    NotificationKind::Error,
                    format!("Task failed: {}", task.title),
                    message,
                )
                .await;
            }
        }
        Ok(updated)
    }

    /// Fail every task a previous process left running. Returns how many
    /// were recovered.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stranded = self.store.call(|s| s.running_tasks()).await?;
        let count = stranded.len();
        for task in stranded {
            warn!(task_id = %task.id, status = %task.status, "Recovering interrupted task");
            if let Err(e) = self
                .recover(&task.id, ErrorCode::Interrupted, "Interrupted by a service restart")
                .await
            {
                error!(task_id = %task.id, error = ?e, "Failed to recover interrupted task");
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl TaskRunner for AgentRunner {
    async fn run_task(&self, task: Task, worker_id: &str) -> Result<()> {
        let token = self.shutdown.child_token();
        self.running.lock().await.insert(
            task.id.clone(),
            RunningAttempt {
                token: token.clone(),
                user_cancelled: false,
            },
        );
        let task_id = task.id.clone();
        let result = self.run_attempt(task, worker_id, token).await;
        self.running.lock().await.remove(&task_id);
        result
    }

    async fn cancel(&self, task_id: &str) -> bool {
        match self.running.lock().await.get_mut(task_id) {
            Some(attempt) => {
                info!(task_id, "Signalling running attempt");
                attempt.user_cancelled = true;
                attempt.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn interrupt_all(&self) {
        let running = self.running.lock().await.len();
        info!(running, "Interrupting running attempts");
        self.shutdown.cancel();
    }

    async fn recover(&self, task_id: &str, code: ErrorCode, message: &str) -> Result<()> {
        self.running.lock().await.remove(task_id);
        let id = task_id.to_string();
        let task = self.store.call(move |s| s.require_task(&id)).await?;
        if !task.status.is_running() {
            return Ok(());
        }
        let run = match task.current_run_id.clone() {
            Some(run_id) => self.store.call(move |s| s.get_run(&run_id)).await?,
            None => None,
        };
        self.finalize(&task, run.as_ref(), None, Resolution::failed(code, message))
            .await?;
        Ok(())
    }
}
