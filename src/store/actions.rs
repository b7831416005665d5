//! Human decisions applied through the transition primitive.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::JsonStore;
use crate::errors::ActionError;
#[cfg(test)]
use crate::errors::StoreError;
use crate::events::EventKind;
use crate::models::{ActionFailureCode, ErrorCode, PlanResult, Task, TaskMode, TaskStatus};
use crate::plan::{build_exec_prompt, build_revised_prompt};

pub const MAX_BATCH_SIZE: usize = 100;

/// Trim, drop empties and dedupe, keeping first-seen order.
pub fn normalize_task_ids<S: AsRef<str>>(task_ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    task_ids
        .iter()
        .map(|id| id.as_ref().trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFailure {
    pub task_id: String,
    pub error_code: ActionFailureCode,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub requested: usize,
    pub updated: Vec<Task>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub requested: usize,
    pub updated: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            requested: self.requested,
            updated: self.updated.len(),
            failed: self.failed.len(),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The task was queued or awaiting review and is now `CANCELLED`.
    Cancelled(Task),
    /// The task is running; its flag is set and the owning runner will stop it.
    Requested(Task),
}

impl CancelOutcome {
    pub fn task(&self) -> &Task {
        match self {
            Self::Cancelled(task) | Self::Requested(task) => task,
        }
    }
}

fn require_plan_review(task: &Task) -> Result<&PlanResult, ActionError> {
    if task.status != TaskStatus::PlanReview {
        return Err(ActionError::invalid_status(task.status, "PLAN_REVIEW"));
    }
    task.plan_result.as_ref().ok_or_else(|| {
        ActionError::new(
            ActionFailureCode::PlanResultMissing,
            "plan_result is required for PLAN_REVIEW task",
        )
    })
}

/// Merge the reviewer's answers over the recommended ones and check that
/// every question ends up with a known option.
fn resolve_answers(
    plan: &PlanResult,
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ActionError> {
    let invalid = |message: String| ActionError::new(ActionFailureCode::InvalidAnswers, message);

    let mut answers = plan.recommended_answers();
    for (question_id, option_key) in provided {
        let option_key = option_key.trim();
        if option_key.is_empty() {
            continue;
        }
        let question = plan
            .question(question_id)
            .ok_or_else(|| invalid(format!("unknown question id: {question_id}")))?;
        if !question.has_option(option_key) {
            return Err(invalid(format!(
                "unknown option '{option_key}' for question {question_id}"
            )));
        }
        answers.insert(question_id.clone(), option_key.to_string());
    }

    let missing: Vec<&str> = plan
        .questions
        .iter()
        .filter(|q| !answers.contains_key(&q.id))
        .map(|q| q.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!("unanswered questions: {}", missing.join(", "))));
    }
    Ok(answers)
}

impl JsonStore {
    /// `PLAN_REVIEW → READY`, switching the task to EXEC with a prompt that
    /// carries the confirmed plan and answers.
    pub fn confirm_plan(
        &self,
        task_id: &str,
        answers: &BTreeMap<String, String>,
    ) -> Result<Task, ActionError> {
        let task = self.require_task(task_id)?;
        require_plan_review(&task)?;

        self.apply_transition(task_id, TaskStatus::PlanReview, TaskStatus::Ready, |t| {
            let plan = require_plan_review(t)?.clone();
            let resolved = resolve_answers(&plan, answers)?;
            t.prompt = build_exec_prompt(&t.prompt, Some(&plan), &resolved);
            t.plan_answers = resolved;
            t.mode = TaskMode::Exec;
            t.cancel_requested = false;
            t.clear_error();
            Ok(())
        })
    }

    /// `PLAN_REVIEW → TODO`, appending the feedback to the prompt and
    /// discarding the plan so the next attempt produces a fresh one.
    pub fn revise_plan(&self, task_id: &str, feedback: &str) -> Result<Task, ActionError> {
        if feedback.trim().is_empty() {
            return Err(ActionError::new(
                ActionFailureCode::InvalidInput,
                "feedback must not be empty",
            ));
        }
        let task = self.require_task(task_id)?;
        require_plan_review(&task)?;

        self.apply_transition(task_id, TaskStatus::PlanReview, TaskStatus::Todo, |t| {
            require_plan_review(t)?;
            t.prompt = build_revised_prompt(&t.prompt, feedback);
            t.plan_result = None;
            t.plan_answers.clear();
            t.mode = TaskMode::Plan;
            t.cancel_requested = false;
            t.clear_error();
            Ok(())
        })
    }

    /// Cancel a task. Queued tasks and plans awaiting review are cancelled
    /// directly; running tasks get their cancel flag set.
    pub fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome, ActionError> {
        let task = self.require_task(task_id)?;
        match task.status {
            TaskStatus::Todo | TaskStatus::Ready | TaskStatus::PlanReview => {
                let cancelled =
                    self.apply_transition(task_id, task.status, TaskStatus::Cancelled, |t| {
                        t.cancel_requested = false;
                        t.error_code = Some(ErrorCode::Cancelled);
                        t.failure_reason = None;
                        t.error_message = Some("cancelled by user".to_string());
                        Ok::<_, ActionError>(())
                    })?;
                Ok(CancelOutcome::Cancelled(cancelled))
            }
            TaskStatus::PlanRunning | TaskStatus::Running => {
                let flagged = self.update_task(task_id, |t| t.cancel_requested = true)?;
                self.append_event(
                    task_id,
                    EventKind::CancelRequested {
                        message: "Cancel requested by user".to_string(),
                    },
                )?;
                Ok(CancelOutcome::Requested(flagged))
            }
            other => Err(ActionError::invalid_status(
                other,
                "TODO, READY, PLAN_REVIEW, PLAN_RUNNING or RUNNING",
            )),
        }
    }

    /// `REVIEW → DONE`.
    pub fn mark_done(&self, task_id: &str) -> Result<Task, ActionError> {
        let task = self.require_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(ActionError::invalid_status(task.status, "REVIEW"));
        }
        self.apply_transition(task_id, TaskStatus::Review, TaskStatus::Done, |t| {
            t.clear_error();
            Ok::<_, ActionError>(())
        })
    }

    /// `FAILED|CANCELLED → TODO`, keeping the agent session so the next
    /// attempt can resume it. `reset_mode` optionally switches the mode.
    pub fn retry_task(
        &self,
        task_id: &str,
        reset_mode: Option<TaskMode>,
    ) -> Result<Task, ActionError> {
        let task = self.require_task(task_id)?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(ActionError::invalid_status(task.status, "FAILED or CANCELLED"));
        }
        self.apply_transition(task_id, task.status, TaskStatus::Todo, |t| {
            if let Some(mode) = reset_mode {
                t.mode = mode;
            }
            t.cancel_requested = false;
            t.worker_id = None;
            t.current_run_id = None;
            t.pr_url = None;
            t.clear_error();
            Ok::<_, ActionError>(())
        })
    }

    /// Confirm several plans with their recommended answers.
    pub fn batch_confirm(&self, task_ids: &[String]) -> Result<BatchOutcome, ActionError> {
        let ids = checked_batch(task_ids)?;
        let none = BTreeMap::new();
        Ok(self.run_batch(ids, |store, id| {
            let task = store.confirm_plan(id, &none)?;
            store.append_event(
                id,
                EventKind::PlanBatchConfirm {
                    message: "Batch confirmed and moved to READY".to_string(),
                },
            )?;
            Ok(task)
        }))
    }

    /// Revise several plans with the same feedback.
    pub fn batch_revise(
        &self,
        task_ids: &[String],
        feedback: &str,
    ) -> Result<BatchOutcome, ActionError> {
        let ids = checked_batch(task_ids)?;
        if feedback.trim().is_empty() {
            return Err(ActionError::new(
                ActionFailureCode::InvalidInput,
                "feedback must not be empty",
            ));
        }
        Ok(self.run_batch(ids, |store, id| {
            let task = store.revise_plan(id, feedback)?;
            store.append_event(
                id,
                EventKind::PlanBatchRevise {
                    message: "Batch revised and moved back to TODO".to_string(),
                },
            )?;
            Ok(task)
        }))
    }

    fn run_batch<F>(&self, ids: Vec<String>, action: F) -> BatchOutcome
    where
        F: Fn(&JsonStore, &str) -> Result<Task, ActionError>,
    {
        let mut outcome = BatchOutcome {
            requested: ids.len(),
            updated: Vec::new(),
            failed: Vec::new(),
        };
        for id in ids {
            match action(self, &id) {
                Ok(task) => outcome.updated.push(task),
                Err(err) => outcome.failed.push(BatchFailure {
                    task_id: id,
                    error_code: err.code,
                    error_message: err.message,
                }),
            }
        }
        outcome
    }
}

fn checked_batch(task_ids: &[String]) -> Result<Vec<String>, ActionError> {
    let ids = normalize_task_ids(task_ids);
    if ids.is_empty() || ids.len() > MAX_BATCH_SIZE {
        return Err(ActionError::new(
            ActionFailureCode::InvalidInput,
            format!("task_ids count after dedupe must be between 1 and {MAX_BATCH_SIZE}"),
        ));
    }
    Ok(ids)
}
