use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{AgentRunner, Attempt, Resolution, agent_failure};
use crate::errors::GitError;
use crate::events::EventKind;
use crate::git::{Worktree, build_compare_url};
use crate::models::{ErrorCode, ExecStrategy, RepoConfig, StageKind, StepStatus};
use crate::strategy::build_default_strategy;

const PR_BODY: &str = "Automated by repopilot";

/// Stage bookkeeping for one exec attempt: `stage` events, per-stage
/// duration metrics on the run and the strategy step statuses on the task.
struct Stages<'a> {
    runner: &'a AgentRunner,
    task_id: String,
    run_id: String,
    strategy: ExecStrategy,
}

impl<'a> Stages<'a> {
    async fn save_strategy(&self) {
        let id = self.task_id.clone();
        let strategy = self.strategy.clone();
        if let Err(e) = self
            .runner
            .store
            .call(move |s| s.update_task(&id, |t| t.exec_strategy = Some(strategy)))
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "Failed to save execution strategy");
        }
    }

    async fn record(&mut self, stage: StageKind, status: StepStatus, duration_ms: Option<u64>, detail: Option<String>) {
        self.strategy.set_status(stage, status);
        self.runner
            .emit(
                &self.task_id,
                EventKind::Stage {
                    stage,
                    status,
                    duration_ms,
                    detail,
                },
            )
            .await;
        self.save_strategy().await;
    }

    async fn begin(&mut self, stage: StageKind) -> Instant {
        info!(task_id = %self.task_id, stage = %stage, "Stage started");
        self.record(stage, StepStatus::Running, None, None).await;
        Instant::now()
    }

    async fn end(&mut self, stage: StageKind, started: Instant, status: StepStatus, detail: Option<String>) {
        let ms = started.elapsed().as_millis() as u64;
        let run_id = self.run_id.clone();
        let key = stage.metric_key();
        if let Err(e) = self
            .runner
            .store
            .call(move |s| s.update_run(&run_id, |r| {
                r.metrics.insert(key, json!(ms));
            }))
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "Failed to record stage metric");
        }
        self.record(stage, status, Some(ms), detail).await;
    }

    async fn skip(&mut self, stage: StageKind) {
        let reason = self.strategy.step(stage).map(|s| s.reason.clone());
        info!(task_id = %self.task_id, stage = %stage, "Stage skipped");
        self.record(stage, StepStatus::Skipped, None, reason).await;
    }

    /// Mark `stage` failed and turn `err` into the attempt's resolution.
    async fn fail(&mut self, stage: StageKind, started: Instant, err: &GitError) -> Resolution {
        warn!(task_id = %self.task_id, stage = %stage, error = %err, "Stage failed");
        self.end(stage, started, StepStatus::Failed, Some(err.to_string()))
            .await;
        Resolution::pipeline(err)
    }
}

impl AgentRunner {
    /// EXEC attempt: code in a fresh worktree, then deliver the branch.
    pub(super) async fn run_exec(&self, attempt: &mut Attempt) -> Result<Resolution> {
        let Some(repo) = self.repo(&attempt.task.repo_id).await? else {
            return Ok(Resolution::failed(
                ErrorCode::RepoNotFound,
                format!("Repository not found: {}", attempt.task.repo_id),
            ));
        };

        let mut stages = Stages {
            runner: self,
            task_id: attempt.task.id.clone(),
            run_id: attempt.run.id.clone(),
            strategy: build_default_strategy(&repo),
        };
        stages.save_strategy().await;
        self.emit(
            &attempt.task.id,
            EventKind::StrategyGenerated {
                message: stages.strategy.rationale.clone(),
            },
        )
        .await;

        let worktree = match self.pipeline.create_worktree(&repo, &attempt.task).await {
            Ok(worktree) => worktree,
            Err(e) => {
                warn!(task_id = %attempt.task.id, error = %e, "Worktree creation failed");
                return Ok(Resolution::pipeline(&e));
            }
        };
        let (run_id, recorded) = (attempt.run.id.clone(), worktree.clone());
        self.store
            .call(move |s| {
                s.update_run(&run_id, |r| {
                    r.worktree_path = Some(recorded.path);
                    r.branch_name = Some(recorded.branch);
                    r.base_commit = Some(recorded.base_commit);
                })
            })
            .await
            .context("Failed to record worktree on run")?;

        if let Err(e) = self.pipeline.setup_isolated_data(&repo, &worktree.path).await {
            return Ok(Resolution::pipeline(&e));
        }

        let started = stages.begin(StageKind::Coding).await;
        let outcome = self
            .agent
            .run(&attempt.task, &attempt.task.prompt, &worktree.path, &attempt.cancel)
            .await?;
        self.emit(
            &attempt.task.id,
            EventKind::AssistantText {
                text: outcome.text.clone(),
            },
        )
        .await;
        if let Some(resolution) = agent_failure(&outcome, ErrorCode::ExecExitNonzero, "coding") {
            stages
                .end(StageKind::Coding, started, StepStatus::Failed, resolution.message.clone())
                .await;
            return Ok(resolution);
        }
        stages.end(StageKind::Coding, started, StepStatus::Done, None).await;

        self.deliver(attempt, &repo, &worktree, &mut stages).await
    }

    /// commit → rebase → test → push → create_pr. The first failing stage
    /// ends the attempt; a cancel request is honoured between stages.
    async fn deliver(
        &self,
        attempt: &mut Attempt,
        repo: &RepoConfig,
        worktree: &Worktree,
        stages: &mut Stages<'_>,
    ) -> Result<Resolution> {
        let task_id = attempt.task.id.clone();
        let path: &Path = &worktree.path;
        let cancelled = || Resolution::cancelled("Cancelled during delivery");

        // commit
        if self.cancel_requested(attempt).await {
            return Ok(cancelled());
        }
        let started = stages.begin(StageKind::Commit).await;
        let changed = match self.has_material_changes(path, &worktree.base_commit).await {
            Ok(changed) => changed,
            Err(e) => return Ok(stages.fail(StageKind::Commit, started, &e).await),
        };
        if !changed {
            stages
                .end(StageKind::Commit, started, StepStatus::Failed, Some("no changes".into()))
                .await;
            return Ok(Resolution::failed(
                ErrorCode::NoChanges,
                "Agent finished but produced no git changes",
            ));
        }
        let message = format!("task({task_id}): apply changes");
        if let Err(e) = self.pipeline.commit(path, &message).await {
            return Ok(stages.fail(StageKind::Commit, started, &e).await);
        }
        let sha = match self.pipeline.git().current_commit(path).await {
            Ok(sha) => sha,
            Err(e) => return Ok(stages.fail(StageKind::Commit, started, &e).await),
        };
        let run_id = attempt.run.id.clone();
        let recorded = sha.clone();
        self.store
            .call(move |s| s.update_run(&run_id, |r| r.commit_sha = Some(recorded)))
            .await
            .context("Failed to record commit on run")?;
        stages
            .end(StageKind::Commit, started, StepStatus::Done, Some(sha))
            .await;

        // rebase
        if self.cancel_requested(attempt).await {
            return Ok(cancelled());
        }
        let started = stages.begin(StageKind::Rebase).await;
        if let Err(e) = self.pipeline.rebase(path, &repo.main_branch).await {
            return Ok(stages.fail(StageKind::Rebase, started, &e).await);
        }
        stages.end(StageKind::Rebase, started, StepStatus::Done, None).await;

        // test
        if self.cancel_requested(attempt).await {
            return Ok(cancelled());
        }
        if stages.strategy.should_skip(StageKind::Test) {
            stages.skip(StageKind::Test).await;
        } else {
            let started = stages.begin(StageKind::Test).await;
            let result = match repo.test_command() {
                Some(cmd) => self.pipeline.run_tests(path, cmd).await,
                None => Err(GitError::TestFailure {
                    exit_code: None,
                    output: "quality gate requires tests but no test command is configured".into(),
                }),
            };
            match result {
                Ok(output) => {
                    attempt.test_output = Some(output);
                    stages.end(StageKind::Test, started, StepStatus::Done, None).await;
                }
                Err(e) => {
                    if let GitError::TestFailure { output, .. } = &e {
                        attempt.test_output = Some(output.clone());
                    }
                    return Ok(stages.fail(StageKind::Test, started, &e).await);
                }
            }
        }

        // push
        if self.cancel_requested(attempt).await {
            return Ok(cancelled());
        }
        let started = stages.begin(StageKind::Push).await;
        if let Err(e) = self.pipeline.push(path, &worktree.branch).await {
            return Ok(stages.fail(StageKind::Push, started, &e).await);
        }
        stages.end(StageKind::Push, started, StepStatus::Done, None).await;

        // create_pr
        if self.cancel_requested(attempt).await {
            return Ok(cancelled());
        }
        if stages.strategy.should_skip(StageKind::CreatePr) {
            stages.skip(StageKind::CreatePr).await;
            return Ok(Resolution::review(None));
        }
        let started = stages.begin(StageKind::CreatePr).await;
        let title = format!("[{}] {}", attempt.task.id, attempt.task.title);
        let pr_url = match self
            .pipeline
            .create_pr(repo, &worktree.branch, &title, PR_BODY)
            .await
        {
            Ok(url) => url,
            Err(GitError::PrCredentialsMissing(reason)) => {
                let compare = repo
                    .remote()
                    .and_then(|remote| build_compare_url(remote, &repo.main_branch, &worktree.branch));
                let Some(url) = compare else {
                    let err = GitError::PrCreate(reason);
                    return Ok(stages.fail(StageKind::CreatePr, started, &err).await);
                };
                warn!(task_id = %task_id, url = %url, "No pull request credentials, using compare URL");
                self.emit(
                    &task_id,
                    EventKind::PrFallback {
                        message: reason,
                        compare_url: Some(url.clone()),
                    },
                )
                .await;
                url
            }
            Err(e) => return Ok(stages.fail(StageKind::CreatePr, started, &e).await),
        };
        stages
            .end(StageKind::CreatePr, started, StepStatus::Done, Some(pr_url.clone()))
            .await;
        info!(task_id = %task_id, pr_url = %pr_url, "Delivery finished");
        Ok(Resolution::review(Some(pr_url)))
    }

    /// Uncommitted changes, or commits the agent made on its own.
    async fn has_material_changes(&self, path: &Path, base_commit: &str) -> Result<bool, GitError> {
        if self.pipeline.has_changes(path).await? {
            return Ok(true);
        }
        self.pipeline.head_moved(path, base_commit).await
    }
}
