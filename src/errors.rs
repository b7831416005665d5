//! Typed error hierarchy for repopilot.
//!
//! - `StoreError`: durable store and state machine failures
//! - `GitError`: worktree and delivery pipeline failures
//! - `ActionError`: human action failures, carrying an `ActionFailureCode`

use thiserror::Error;

use crate::models::{ActionFailureCode, FailureReason, TaskMode, TaskStatus};

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Repository {id} not found")]
    RepoNotFound { id: String },

    #[error("Repository {id} is disabled")]
    RepoDisabled { id: String },

    #[error("Task {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Invalid transition {from} -> {to} for {mode} task")]
    InvalidTransition {
        mode: TaskMode,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::RepoNotFound { .. } => "REPO_NOT_FOUND",
            Self::RepoDisabled { .. } => "REPO_DISABLED",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::LockPoisoned | Self::Other(_) => "STORE_ERROR",
        }
    }
}

/// Errors from git worktree management and the delivery pipeline.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Worktree creation failed: {0}")]
    WorktreeCreate(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Rebase conflict: {0}")]
    RebaseConflict(String),

    #[error("Rebase failed: {0}")]
    Rebase(String),

    #[error("Tests failed{}: {output}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    TestFailure {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Pull request creation failed: {0}")]
    PrCreate(String),

    #[error("No pull request credentials: {0}")]
    PrCredentialsMissing(String),

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GitError {
    /// Failure sub-reason for errors that identify a pipeline stage.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::WorktreeCreate(_) => Some(FailureReason::WorktreeCreateFailed),
            Self::Commit(_) => Some(FailureReason::CommitFailed),
            Self::RebaseConflict(_) => Some(FailureReason::RebaseConflict),
            Self::Rebase(_) => Some(FailureReason::RebaseFailed),
            Self::TestFailure { .. } => Some(FailureReason::TestFailure),
            Self::Push(_) => Some(FailureReason::PushFailed),
            Self::PrCreate(_) | Self::PrCredentialsMissing(_) => {
                Some(FailureReason::PrCreateFailed)
            }
            Self::Command { .. } | Self::Other(_) => None,
        }
    }
}

/// Failure of a human action.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ActionError {
    pub code: ActionFailureCode,
    pub message: String,
}

impl ActionError {
    pub fn new(code: ActionFailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_status(actual: TaskStatus, expected: &str) -> Self {
        Self::new(
            ActionFailureCode::InvalidStatus,
            format!("task status must be {expected}, got {actual}"),
        )
    }
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::TaskNotFound { .. } => ActionFailureCode::TaskNotFound,
            StoreError::Conflict { .. } | StoreError::InvalidTransition { .. } => {
                ActionFailureCode::InvalidStatus
            }
            StoreError::InvalidInput(_) => ActionFailureCode::InvalidInput,
            _ => ActionFailureCode::UpdateFailed,
        };
        Self::new(code, err.to_string())
    }
}
