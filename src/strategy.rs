//! Execution strategy shown alongside an EXEC task: which delivery stages
//! will run for its repository and why.

use crate::models::{ExecStrategy, RepoConfig, StageKind, StepStatus, StrategyDecision, StrategyStep};

pub const DEFAULT_TEMPLATE: &str = "PIPELINE";

fn step(kind: StageKind, label: &str, skip: bool, reason: &str) -> StrategyStep {
    StrategyStep {
        kind,
        label: label.to_string(),
        skip,
        reason: reason.to_string(),
        status: StepStatus::Pending,
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

pub fn build_default_strategy(repo: &RepoConfig) -> ExecStrategy {
    let has_tests = repo.test_command().is_some();
    let run_tests = has_tests || repo.requires_tests();
    let has_remote = repo.remote().is_some();

    let test_reason = match (has_tests, repo.requires_tests()) {
        (true, _) => "repository has a test command",
        (false, true) => "quality gate requires tests but no test command is configured",
        (false, false) => "no test command configured",
    };
    let pr_reason = if has_remote {
        "repository has an owner/repo remote"
    } else {
        "no owner/repo remote configured"
    };

    ExecStrategy {
        template: DEFAULT_TEMPLATE.to_string(),
        steps: vec![
            step(StageKind::Coding, "Run the coding agent", false, "apply the requested change"),
            step(StageKind::Commit, "Commit changes", false, "record the worktree changes"),
            step(StageKind::Rebase, "Rebase onto main", false, "keep history linear"),
            step(StageKind::Test, "Run tests", !run_tests, test_reason),
            step(StageKind::Push, "Push branch", false, "publish the task branch"),
            step(StageKind::CreatePr, "Open pull request", !has_remote, pr_reason),
        ],
        decisions: vec![
            StrategyDecision {
                key: "test_strategy".to_string(),
                question: "Run tests?".to_string(),
                choice: yes_no(run_tests),
                reason: test_reason.to_string(),
            },
            StrategyDecision {
                key: "pr_strategy".to_string(),
                question: "Open a pull request?".to_string(),
                choice: yes_no(has_remote),
                reason: pr_reason.to_string(),
            },
        ],
        rationale: format!(
            "Agent codes in an isolated worktree, then commit, rebase{}, push{}.",
            if run_tests { ", test" } else { "" },
            if has_remote { " and pull request" } else { "" }
        ),
    }
}
