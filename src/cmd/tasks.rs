//! Task and plan commands.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::json;

use repopilot::config::Settings;
use repopilot::events::{Event, EventKind};
use repopilot::models::{NewTask, Task, TaskFilter};
use repopilot::store::{BatchOutcome, CancelOutcome};
use repopilot::util::truncate_chars;

use super::{offline_control, open_store, print_json};
use crate::{PlanCommands, TaskCommands};

pub(crate) fn print_task_rows(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    println!(
        "{:<12} {:<13} {:<5} {:<16} {:>4}  Title",
        "Id", "Status", "Mode", "Repo", "Prio"
    );
    for task in tasks {
        println!(
            "{:<12} {:<13} {:<5} {:<16} {:>4}  {}",
            task.id,
            task.status.as_str(),
            task.mode.as_str(),
            task.repo_id,
            task.priority,
            task.title
        );
    }
}

fn print_task(task: &Task) {
    println!();
    println!("{}  {}", task.id, task.title);
    println!("  status:   {} ({})", task.status, task.mode);
    println!("  repo:     {}", task.repo_id);
    println!("  priority: {}", task.priority);
    if let Some(worker) = &task.worker_id {
        println!("  worker:   {worker}");
    }
    if let Some(pr_url) = &task.pr_url {
        println!("  pr:       {pr_url}");
    }
    if let Some(code) = task.error_code {
        let reason = task
            .failure_reason
            .map(|r| format!(" / {r}"))
            .unwrap_or_default();
        println!(
            "  error:    {code}{reason}: {}",
            task.error_message.as_deref().unwrap_or("")
        );
    }
    if task.cancel_requested {
        println!("  cancel requested");
    }
    if let Some(plan) = &task.plan_result {
        println!();
        println!("Plan: {}", plan.summary);
        for (i, step) in plan.steps.iter().enumerate() {
            println!("  {}. {step}", i + 1);
        }
        for question in &plan.questions {
            let recommended = question.recommended_option_key.as_deref().unwrap_or("-");
            println!("  [{}] {} (recommended: {recommended})", question.id, question.title);
            for option in &question.options {
                println!("      {} = {}", option.key, option.label);
            }
        }
    }
    println!();
}

fn describe(kind: &EventKind) -> String {
    match kind {
        EventKind::Command { cmd, .. } => format!("command: {cmd}"),
        EventKind::Stream { line, stderr } => {
            let prefix = if *stderr { "stderr" } else { "stream" };
            format!("{prefix}: {}", truncate_chars(line, 160))
        }
        EventKind::Result {
            exit_code,
            cancelled,
            timed_out,
        } => format!("result: exit {exit_code} cancelled={cancelled} timed_out={timed_out}"),
        EventKind::Timeout { message, .. } => format!("timeout: {message}"),
        EventKind::Artifact { path } => format!("artifact: {path}"),
        EventKind::SessionCreated { message, .. }
        | EventKind::SessionResumed { message, .. }
        | EventKind::SessionResumeFailed { message, .. }
        | EventKind::SessionFallbackCreated { message, .. }
        | EventKind::StrategyGenerated { message }
        | EventKind::CancelRequested { message }
        | EventKind::PlanBatchConfirm { message }
        | EventKind::PlanBatchRevise { message } => message.clone(),
        EventKind::AssistantText { text } => format!("assistant: {}", truncate_chars(text, 160)),
        EventKind::Stage {
            stage,
            status,
            duration_ms,
            detail,
        } => {
            let mut line = format!("stage {stage}: {status}");
            if let Some(ms) = duration_ms {
                line.push_str(&format!(" ({ms} ms)"));
            }
            if let Some(detail) = detail {
                line.push_str(&format!(" {}", truncate_chars(detail, 120)));
            }
            line
        }
        EventKind::PrFallback { compare_url, .. } => {
            format!("pr fallback: {}", compare_url.as_deref().unwrap_or("-"))
        }
        EventKind::WorktreeCleanup {
            trigger_status,
            result,
            failed_step,
            ..
        } => {
            let step = failed_step
                .as_deref()
                .map(|s| format!(" at {s}"))
                .unwrap_or_default();
            format!("worktree cleanup on {trigger_status}: {result:?}{step}")
        }
        EventKind::Unknown => "unknown event".to_string(),
    }
}

fn print_events(events: &[Event]) {
    for event in events {
        println!(
            "{:>5} {} {}",
            event.seq,
            event.ts.format("%Y-%m-%d %H:%M:%S"),
            describe(&event.kind)
        );
    }
}

fn print_batch(outcome: &BatchOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "updated": outcome.updated,
            "failed": outcome.failed,
            "counts": outcome.counts(),
        }));
    }
    let counts = outcome.counts();
    println!(
        "requested {}, updated {}, failed {}",
        counts.requested, counts.updated, counts.failed
    );
    for task in &outcome.updated {
        println!("  ok     {} -> {}", task.id, task.status);
    }
    for failure in &outcome.failed {
        println!(
            "  failed {} {}: {}",
            failure.task_id, failure.error_code, failure.error_message
        );
    }
    Ok(())
}

pub async fn cmd_task(settings: &Settings, json: bool, command: TaskCommands) -> Result<()> {
    let store = open_store(settings)?;
    let control = offline_control(settings, &store);

    let task = match command {
        TaskCommands::Create {
            repo,
            title,
            prompt,
            mode,
            priority,
            permission_mode,
        } => {
            let mut new = NewTask::new(&repo, &title, &prompt, mode).priority(priority);
            new.permission_mode = permission_mode;
            store.blocking().create_task(new)?
        }
        TaskCommands::List {
            repo,
            status,
            keyword,
        } => {
            let filter = TaskFilter {
                repo_id: repo,
                status,
                keyword,
            };
            let tasks = store.blocking().list_tasks(&filter)?;
            if json {
                return print_json(&tasks);
            }
            print_task_rows(&tasks);
            return Ok(());
        }
        TaskCommands::Show { id } => {
            let task = store.blocking().require_task(&id)?;
            if json {
                let runs = store.blocking().list_runs(&id)?;
                return print_json(&json!({ "task": task, "runs": runs }));
            }
            task
        }
        TaskCommands::Cancel { id } => match control.cancel(&id).await? {
            CancelOutcome::Cancelled(task) => task,
            CancelOutcome::Requested(task) => {
                if !json {
                    println!("Cancel requested; the running attempt stops at its next check.");
                }
                task
            }
        },
        TaskCommands::Retry { id, mode } => control.retry(&id, mode).await?,
        TaskCommands::Done { id } => control.mark_done(&id).await?,
        TaskCommands::Confirm { id, answers } => {
            let answers: BTreeMap<String, String> = answers.into_iter().collect();
            control.confirm(&id, answers).await?
        }
        TaskCommands::Revise { id, feedback } => control.revise(&id, &feedback).await?,
        TaskCommands::Events { id, cursor, limit } => {
            let batch = store.blocking().read_events(&id, cursor, limit)?;
            if json {
                return print_json(&batch);
            }
            print_events(&batch.events);
            println!("next cursor: {}", batch.next_cursor);
            return Ok(());
        }
    };

    if json {
        return print_json(&task);
    }
    print_task(&task);
    Ok(())
}

pub async fn cmd_plan(settings: &Settings, json: bool, command: PlanCommands) -> Result<()> {
    let store = open_store(settings)?;
    let control = offline_control(settings, &store);
    let outcome = match command {
        PlanCommands::BatchConfirm { ids } => control.batch_confirm(ids).await?,
        PlanCommands::BatchRevise { ids, feedback } => control.batch_revise(ids, &feedback).await?,
    };
    print_batch(&outcome, json)
}
