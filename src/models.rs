use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAIN_BRANCH: &str = "main";
pub const DEFAULT_TEST_COMMAND: &str = "npm run test:ci --if-present || echo skip-tests";

/// Implements `as_str`, `FromStr` and `Display` for a fieldless enum whose
/// serde names are the given literals.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    PlanRunning,
    PlanReview,
    Ready,
    Running,
    Review,
    Done,
    Failed,
    Cancelled,
}

string_enum!(TaskStatus {
    Todo => "TODO",
    PlanRunning => "PLAN_RUNNING",
    PlanReview => "PLAN_REVIEW",
    Ready => "READY",
    Running => "RUNNING",
    Review => "REVIEW",
    Done => "DONE",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::PlanRunning | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    Plan,
    Exec,
}

string_enum!(TaskMode {
    Plan => "PLAN",
    Exec => "EXEC",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionMode {
    #[default]
    Bypass,
    Default,
}

string_enum!(PermissionMode {
    Bypass => "BYPASS",
    Default => "DEFAULT",
});

impl PermissionMode {
    /// Value passed to the agent's `--permission-mode` flag.
    pub fn agent_flag(&self) -> &'static str {
        match self {
            Self::Bypass => "bypassPermissions",
            Self::Default => "default",
        }
    }
}

/// Stable failure codes stored on a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PlanExitNonzero,
    ExecExitNonzero,
    Timeout,
    NoChanges,
    GitPipelineFailed,
    SessionResumeFailed,
    Cancelled,
    RepoNotFound,
    SchedulerCrash,
    Interrupted,
    UnexpectedError,
}

string_enum!(ErrorCode {
    PlanExitNonzero => "PLAN_EXIT_NONZERO",
    ExecExitNonzero => "EXEC_EXIT_NONZERO",
    Timeout => "TIMEOUT",
    NoChanges => "NO_CHANGES",
    GitPipelineFailed => "GIT_PIPELINE_FAILED",
    SessionResumeFailed => "SESSION_RESUME_FAILED",
    Cancelled => "CANCELLED",
    RepoNotFound => "REPO_NOT_FOUND",
    SchedulerCrash => "SCHEDULER_CRASH",
    Interrupted => "INTERRUPTED",
    UnexpectedError => "UNEXPECTED_ERROR",
});

/// Sub-reason attached to `GIT_PIPELINE_FAILED`, naming the stage that broke.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    WorktreeCreateFailed,
    CommitFailed,
    RebaseConflict,
    RebaseFailed,
    TestFailure,
    PushFailed,
    PrCreateFailed,
}

string_enum!(FailureReason {
    WorktreeCreateFailed => "WORKTREE_CREATE_FAILED",
    CommitFailed => "COMMIT_FAILED",
    RebaseConflict => "REBASE_CONFLICT",
    RebaseFailed => "REBASE_FAILED",
    TestFailure => "TEST_FAILURE",
    PushFailed => "PUSH_FAILED",
    PrCreateFailed => "PR_CREATE_FAILED",
});

/// Failure codes returned by human actions (confirm, revise, cancel, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionFailureCode {
    TaskNotFound,
    InvalidStatus,
    PlanResultMissing,
    UpdateFailed,
    InvalidAnswers,
    InvalidInput,
}

string_enum!(ActionFailureCode {
    TaskNotFound => "TASK_NOT_FOUND",
    InvalidStatus => "INVALID_STATUS",
    PlanResultMissing => "PLAN_RESULT_MISSING",
    UpdateFailed => "UPDATE_FAILED",
    InvalidAnswers => "INVALID_ANSWERS",
    InvalidInput => "INVALID_INPUT",
});

/// Opt-in delivery rules for a repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityGate {
    /// Fail the TEST stage instead of skipping it when no test command is configured.
    #[serde(default)]
    pub require_tests: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoConfig {
    pub id: String,
    pub name: String,
    pub root_path: PathBuf,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// `owner/repo` on the hosting provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,
    /// Repository-local runtime data copied into every worktree.
    #[serde(default, alias = "shared_symlink_paths")]
    pub data_paths: Vec<String>,
    #[serde(default = "default_forbidden_data_paths", alias = "forbidden_symlink_paths")]
    pub forbidden_data_paths: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGate>,
}

fn default_main_branch() -> String {
    DEFAULT_MAIN_BRANCH.to_string()
}

fn default_test_command() -> String {
    DEFAULT_TEST_COMMAND.to_string()
}

fn default_forbidden_data_paths() -> Vec<String> {
    vec!["PROGRESS.md".to_string()]
}

fn default_enabled() -> bool {
    true
}

impl RepoConfig {
    pub fn new(id: &str, name: &str, root_path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            root_path,
            main_branch: default_main_branch(),
            test_command: default_test_command(),
            github_repo: None,
            data_paths: Vec::new(),
            forbidden_data_paths: default_forbidden_data_paths(),
            enabled: true,
            quality_gate: None,
        }
    }

    /// The `owner/repo` remote, if one is configured and well formed.
    pub fn remote(&self) -> Option<&str> {
        let remote = self.github_repo.as_deref()?.trim().trim_matches('/');
        let (owner, name) = remote.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(remote)
    }

    pub fn test_command(&self) -> Option<&str> {
        let cmd = self.test_command.trim();
        (!cmd.is_empty()).then_some(cmd)
    }

    pub fn requires_tests(&self) -> bool {
        self.quality_gate.as_ref().is_some_and(|g| g.require_tests)
    }
}

/// Partial update applied by `JsonStore::patch_repo`.
#[derive(Debug, Clone, Default)]
pub struct RepoPatch {
    pub enabled: Option<bool>,
    pub test_command: Option<String>,
    pub main_branch: Option<String>,
    pub github_repo: Option<String>,
}

/// A git repository found on disk by the registry scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRepo {
    pub name: String,
    pub root_path: PathBuf,
    pub main_branch: String,
    pub github_repo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanOption {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanQuestion {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<PlanOption>,
    #[serde(default)]
    pub recommended_option_key: Option<String>,
}

impl PlanQuestion {
    pub fn has_option(&self, key: &str) -> bool {
        self.options.is_empty() || self.options.iter().any(|o| o.key == key)
    }
}

/// Structured proposal produced by a PLAN attempt. Every field has a default
/// so malformed agent output still yields a value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub new_dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_time: String,
    #[serde(default)]
    pub validation: String,
    #[serde(default)]
    pub rollback: String,
    #[serde(default)]
    pub questions: Vec<PlanQuestion>,
    #[serde(default)]
    pub recommended_prompt: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub valid_json: bool,
}

impl PlanResult {
    pub fn question(&self, id: &str) -> Option<&PlanQuestion> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Answers taken from each question's recommended option.
    pub fn recommended_answers(&self) -> BTreeMap<String, String> {
        self.questions
            .iter()
            .filter_map(|q| {
                let key = q.recommended_option_key.as_deref()?.trim();
                (!key.is_empty()).then(|| (q.id.clone(), key.to_string()))
            })
            .collect()
    }
}

/// Kinds of work in an exec attempt, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Coding,
    Commit,
    Rebase,
    Test,
    Push,
    CreatePr,
}

string_enum!(StageKind {
    Coding => "CODING",
    Commit => "COMMIT",
    Rebase => "REBASE",
    Test => "TEST",
    Push => "PUSH",
    CreatePr => "CREATE_PR",
});

impl StageKind {
    /// Key used for per-stage duration metrics on a run.
    pub fn metric_key(&self) -> String {
        format!("{}_ms", self.as_str().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

string_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
    Skipped => "skipped",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyStep {
    #[serde(rename = "type")]
    pub kind: StageKind,
    pub label: String,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyDecision {
    pub key: String,
    pub question: String,
    pub choice: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecStrategy {
    pub template: String,
    #[serde(default)]
    pub steps: Vec<StrategyStep>,
    #[serde(default)]
    pub decisions: Vec<StrategyDecision>,
    #[serde(default)]
    pub rationale: String,
}

impl ExecStrategy {
    pub fn step(&self, kind: StageKind) -> Option<&StrategyStep> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    pub fn should_skip(&self, kind: StageKind) -> bool {
        self.step(kind).is_some_and(|s| s.skip)
    }

    pub fn set_status(&mut self, kind: StageKind, status: StepStatus) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.kind == kind) {
            step.status = status;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub repo_id: String,
    pub title: String,
    pub prompt: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_run_id: Option<String>,
    #[serde(default)]
    pub claude_session_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub plan_result: Option<PlanResult>,
    #[serde(default)]
    pub plan_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub exec_strategy: Option<ExecStrategy>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    pub fn clear_error(&mut self) {
        self.error_code = None;
        self.failure_reason = None;
        self.error_message = None;
    }
}

/// Input for `JsonStore::create_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub repo_id: String,
    pub title: String,
    pub prompt: String,
    pub mode: TaskMode,
    pub permission_mode: PermissionMode,
    pub priority: i64,
}

impl NewTask {
    pub fn new(repo_id: &str, title: &str, prompt: &str, mode: TaskMode) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            title: title.to_string(),
            prompt: prompt.to_string(),
            mode,
            permission_mode: PermissionMode::default(),
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Filter for `JsonStore::list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub repo_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub keyword: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(repo_id) = &self.repo_id
            && &task.repo_id != repo_id
        {
            return false;
        }
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(keyword) = self.keyword.as_deref().map(str::trim)
            && !keyword.is_empty()
        {
            let needle = keyword.to_lowercase();
            return task.title.to_lowercase().contains(&needle)
                || task.prompt.to_lowercase().contains(&needle)
                || task.id.to_lowercase().contains(&needle);
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    pub status: TaskStatus,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl TaskRun {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

string_enum!(NotificationKind {
    Info => "INFO",
    Success => "SUCCESS",
    Error => "ERROR",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

/// Display columns of the task board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardColumn {
    Todo,
    Running,
    Review,
    Done,
    Failed,
    Cancelled,
}

string_enum!(BoardColumn {
    Todo => "TODO",
    Running => "RUNNING",
    Review => "REVIEW",
    Done => "DONE",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl BoardColumn {
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Todo | TaskStatus::Ready => Self::Todo,
            TaskStatus::PlanRunning | TaskStatus::Running => Self::Running,
            TaskStatus::PlanReview | TaskStatus::Review => Self::Review,
            TaskStatus::Done => Self::Done,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub column: BoardColumn,
    pub count: usize,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub columns: Vec<ColumnView>,
}

impl BoardView {
    pub fn column(&self, column: BoardColumn) -> Option<&ColumnView> {
        self.columns.iter().find(|c| c.column == column)
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.columns
            .iter()
            .map(|c| (c.column.as_str().to_string(), c.count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert!("BOGUS".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_serde_matches_as_str() {
        let json = serde_json::to_string(&TaskStatus::PlanReview).unwrap();
        assert_eq!(json, "\"PLAN_REVIEW\"");
        let code = serde_json::to_string(&ErrorCode::NoChanges).unwrap();
        assert_eq!(code, "\"NO_CHANGES\"");
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = TaskStatus::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![&TaskStatus::Done, &TaskStatus::Failed, &TaskStatus::Cancelled]
        );
    }

    #[test]
    fn test_board_column_mapping_covers_every_status() {
        assert_eq!(BoardColumn::for_status(TaskStatus::Ready), BoardColumn::Todo);
        assert_eq!(BoardColumn::for_status(TaskStatus::PlanRunning), BoardColumn::Running);
        assert_eq!(BoardColumn::for_status(TaskStatus::PlanReview), BoardColumn::Review);
        assert_eq!(BoardColumn::for_status(TaskStatus::Cancelled), BoardColumn::Cancelled);
    }

    #[test]
    fn test_repo_config_defaults_from_minimal_json() {
        let repo: RepoConfig =
            serde_json::from_str(r#"{"id":"web","name":"web","root_path":"/srv/web"}"#).unwrap();
        assert_eq!(repo.main_branch, "main");
        assert_eq!(repo.test_command, DEFAULT_TEST_COMMAND);
        assert_eq!(repo.forbidden_data_paths, vec!["PROGRESS.md".to_string()]);
        assert!(repo.enabled);
        assert!(repo.remote().is_none());
    }

    #[test]
    fn test_repo_config_accepts_legacy_symlink_fields() {
        let repo: RepoConfig = serde_json::from_str(
            r#"{"id":"a","name":"a","root_path":"/a","shared_symlink_paths":["data/x.json"]}"#,
        )
        .unwrap();
        assert_eq!(repo.data_paths, vec!["data/x.json".to_string()]);
    }

    #[test]
    fn test_repo_remote_validation() {
        let mut repo = RepoConfig::new("a", "a", PathBuf::from("/a"));
        repo.github_repo = Some("acme/widgets".into());
        assert_eq!(repo.remote(), Some("acme/widgets"));
        repo.github_repo = Some("acme".into());
        assert_eq!(repo.remote(), None);
        repo.github_repo = Some("/acme/widgets/".into());
        assert_eq!(repo.remote(), Some("acme/widgets"));
    }

    #[test]
    fn test_recommended_answers_skip_blank_keys() {
        let plan = PlanResult {
            questions: vec![
                PlanQuestion {
                    id: "q1".into(),
                    title: "Storage".into(),
                    recommended_option_key: Some(" a ".into()),
                    ..Default::default()
                },
                PlanQuestion {
                    id: "q2".into(),
                    title: "Naming".into(),
                    recommended_option_key: Some("  ".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let answers = plan.recommended_answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers["q1"], "a");
    }

    #[test]
    fn test_task_filter_keyword_is_case_insensitive() {
        let now = Utc::now();
        let task = Task {
            id: "260101-001".into(),
            repo_id: "web".into(),
            title: "Add Input Validation".into(),
            prompt: "validate the signup form".into(),
            mode: TaskMode::Plan,
            status: TaskStatus::Todo,
            permission_mode: PermissionMode::Bypass,
            priority: 0,
            created_at: now,
            updated_at: now,
            current_run_id: None,
            claude_session_id: None,
            worker_id: None,
            plan_result: None,
            plan_answers: BTreeMap::new(),
            exec_strategy: None,
            pr_url: None,
            error_code: None,
            failure_reason: None,
            error_message: None,
            cancel_requested: false,
        };
        let filter = TaskFilter {
            keyword: Some("input VALIDATION".into()),
            ..Default::default()
        };
        assert!(filter.matches(&task));
        let filter = TaskFilter {
            repo_id: Some("api".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }
}
