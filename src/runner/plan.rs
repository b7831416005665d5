use anyhow::Result;
use tracing::{info, warn};

use super::{AgentRunner, Attempt, Resolution, agent_failure};
use crate::models::ErrorCode;
use crate::plan::{build_plan_prompt, parse_plan_output};

impl AgentRunner {
    /// PLAN attempt: the agent reads the repository root and answers with a
    /// plan. Unparseable replies still reach `PLAN_REVIEW` with `raw_text`.
    pub(super) async fn run_plan(&self, attempt: &mut Attempt) -> Result<Resolution> {
        let task = &attempt.task;
        let Some(repo) = self.repo(&task.repo_id).await? else {
            return Ok(Resolution::failed(
                ErrorCode::RepoNotFound,
                format!("Repository not found: {}", task.repo_id),
            ));
        };

        let prompt = build_plan_prompt(&task.prompt);
        let outcome = self
            .agent
            .run(task, &prompt, &repo.root_path, &attempt.cancel)
            .await?;
        if let Some(resolution) = agent_failure(&outcome, ErrorCode::PlanExitNonzero, "planning") {
            return Ok(resolution);
        }

        let plan = parse_plan_output(&outcome.text);
        if plan.valid_json {
            info!(task_id = %task.id, questions = plan.questions.len(), "Plan parsed");
        } else {
            warn!(task_id = %task.id, "Plan reply is not valid JSON, keeping raw text");
        }
        Ok(Resolution::plan_review(plan).with_exit_code(outcome.exit_code))
    }
}
