//! Supervision of one coding-agent subprocess attempt.
//!
//! The agent is invoked as
//! `<claude_cmd> -p <prompt> --output-format stream-json --verbose`
//! plus session and permission flags. Every stdout/stderr line becomes a
//! `stream` event; the run ends with a `result` event. The supervisor owns
//! the child process: it enforces the wall-clock deadline, reacts to the
//! in-process cancellation token and to the task's `cancel_requested` flag,
//! and kills the child before returning on either.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::StoreError;
use crate::events::EventKind;
use crate::models::{PermissionMode, Task};
use crate::store::StoreHandle;
use crate::stream::TextCollector;
use crate::util::truncate_chars;

/// Characters of agent output kept in a `session_resume_failed` event.
const RESUME_ERROR_TEXT_LIMIT: usize = 1000;

/// Time allowed for the child to exit after being killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

static RESUME_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)session id .*not found|failed to resume|unable to resume|cannot resume|invalid session|session .*does not exist|no conversation found",
    )
    .expect("valid resume failure regex")
});

/// Whether agent output says the session it was asked to resume is gone.
pub fn is_resume_failure(text: &str) -> bool {
    !text.trim().is_empty() && RESUME_FAILURE.is_match(text)
}

/// How the agent should treat the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUse {
    Create,
    Resume,
}

pub fn build_args(
    prompt: &str,
    session_id: &str,
    session: SessionUse,
    permission: PermissionMode,
) -> Vec<String> {
    let session_flag = match session {
        SessionUse::Create => "--session-id",
        SessionUse::Resume => "--resume",
    };
    [
        "-p",
        prompt,
        "--output-format",
        "stream-json",
        "--verbose",
        session_flag,
        session_id,
        "--permission-mode",
        permission.agent_flag(),
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Result of one supervised attempt (including a session fallback retry).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub exit_code: i32,
    /// Text collected from stdout, joined by newlines.
    pub text: String,
    pub cancelled: bool,
    pub timed_out: bool,
    /// The resume failed and the fallback session failed too.
    pub resume_failed: bool,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.cancelled && !self.timed_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Default)]
struct RawRun {
    exit_code: i32,
    text: String,
    stderr: String,
    cancelled: bool,
    timed_out: bool,
}

#[derive(Clone)]
pub struct AgentSupervisor {
    store: StoreHandle,
    claude_cmd: String,
    timeout: Duration,
    cancel_poll: Duration,
}

impl AgentSupervisor {
    pub fn new(store: StoreHandle, settings: &Settings) -> Self {
        Self {
            store,
            claude_cmd: settings.claude_cmd.clone(),
            timeout: settings.agent_timeout,
            cancel_poll: settings.cancel_poll,
        }
    }

    async fn emit(&self, task_id: &str, kind: EventKind) {
        let id = task_id.to_string();
        if let Err(e) = self
            .store
            .call(move |s| s.append_event(&id, kind))
            .await
        {
            warn!(task_id, error = %e, "Failed to append event");
        }
    }

    async fn cancel_requested(&self, task_id: &str) -> bool {
        let id = task_id.to_string();
        match self
            .store
            .call(move |s| Ok::<_, StoreError>(s.get_task(&id)?.is_some_and(|t| t.cancel_requested)))
            .await
        {
            Ok(flag) => flag,
            Err(e) => {
                warn!(task_id, error = %e, "Failed to read cancel flag");
                false
            }
        }
    }

    async fn store_session(&self, task_id: &str, session_id: &str) -> Result<()> {
        let id = task_id.to_string();
        let session = session_id.to_string();
        self.store
            .call(move |s| s.update_task(&id, |t| t.claude_session_id = Some(session)))
            .await
            .context("Failed to store agent session")?;
        Ok(())
    }

    /// Run the agent for `task` with `prompt` in `workdir`, creating or
    /// resuming the task's session. A resume that fails because the session
    /// is gone is retried once on a fresh session.
    pub async fn run(
        &self,
        task: &Task,
        prompt: &str,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let (session_id, session) = match task.claude_session_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {
                self.emit(
                    &task.id,
                    EventKind::SessionResumed {
                        session_id: id.to_string(),
                        message: format!("Resuming agent session {id}"),
                    },
                )
                .await;
                (id.to_string(), SessionUse::Resume)
            }
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                self.store_session(&task.id, &id).await?;
                self.emit(
                    &task.id,
                    EventKind::SessionCreated {
                        session_id: id.clone(),
                        message: format!("Created agent session {id}"),
                    },
                )
                .await;
                (id, SessionUse::Create)
            }
        };

        let args = build_args(prompt, &session_id, session, task.permission_mode);
        let first = self.run_once(&task.id, &args, workdir, cancel).await?;

        let combined = format!("{}\n{}", first.text, first.stderr);
        let should_fallback = session == SessionUse::Resume
            && !first.cancelled
            && !first.timed_out
            && first.exit_code != 0
            && is_resume_failure(&combined);
        if !should_fallback {
            return Ok(AgentOutcome {
                exit_code: first.exit_code,
                text: first.text,
                cancelled: first.cancelled,
                timed_out: first.timed_out,
                resume_failed: false,
            });
        }

        warn!(task_id = %task.id, session_id = %session_id, "Session resume failed, falling back to a new session");
        self.emit(
            &task.id,
            EventKind::SessionResumeFailed {
                session_id: session_id.clone(),
                message: format!("Resume failed for session {session_id}; falling back to a new session"),
                error_text: truncate_chars(combined.trim(), RESUME_ERROR_TEXT_LIMIT),
            },
        )
        .await;

        let fresh = uuid::Uuid::new_v4().to_string();
        self.store_session(&task.id, &fresh).await?;
        self.emit(
            &task.id,
            EventKind::SessionFallbackCreated {
                old_session_id: session_id,
                session_id: fresh.clone(),
                message: format!("Created fallback agent session {fresh}"),
            },
        )
        .await;

        let args = build_args(prompt, &fresh, SessionUse::Create, task.permission_mode);
        let second = self.run_once(&task.id, &args, workdir, cancel).await?;
        let resume_failed = second.exit_code != 0 && !second.cancelled && !second.timed_out;
        Ok(AgentOutcome {
            exit_code: second.exit_code,
            text: second.text,
            cancelled: second.cancelled,
            timed_out: second.timed_out,
            resume_failed,
        })
    }

    async fn run_once(
        &self,
        task_id: &str,
        args: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<RawRun> {
        self.emit(
            task_id,
            EventKind::Command {
                cmd: format!("{} {}", self.claude_cmd, args.join(" ")),
                workdir: workdir.display().to_string(),
            },
        )
        .await;

        let mut child = Command::new(&self.claude_cmd)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent process {}", self.claude_cmd))?;
        info!(task_id, pid = ?child.id(), "Agent process started");

        let mut stdout = BufReader::new(child.stdout.take().context("Agent stdout not captured")?).lines();
        let mut stderr = BufReader::new(child.stderr.take().context("Agent stderr not captured")?).lines();
        let deadline = Instant::now() + self.timeout;
        let mut poll = tokio::time::interval(self.cancel_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut collector = TextCollector::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stop: Option<Stop> = None;

        while stop.is_none() && (stdout_open || stderr_open) {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        collector.push_line(&line);
                        self.emit(task_id, EventKind::Stream { line, stderr: false }).await;
                        if self.cancel_requested(task_id).await {
                            stop = Some(Stop::Cancelled);
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(task_id, error = %e, "Failed to read agent stdout");
                        stdout_open = false;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        stderr_lines.push(line.clone());
                        self.emit(task_id, EventKind::Stream { line, stderr: true }).await;
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(task_id, error = %e, "Failed to read agent stderr");
                        stderr_open = false;
                    }
                },
                _ = cancel.cancelled() => stop = Some(Stop::Cancelled),
                _ = poll.tick() => {
                    if self.cancel_requested(task_id).await {
                        stop = Some(Stop::Cancelled);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => stop = Some(Stop::TimedOut),
            }
        }

        let mut status = None;
        if stop.is_none() {
            tokio::select! {
                waited = child.wait() => {
                    status = Some(waited.context("Failed to wait for agent process")?);
                }
                _ = cancel.cancelled() => stop = Some(Stop::Cancelled),
                _ = tokio::time::sleep_until(deadline) => stop = Some(Stop::TimedOut),
            }
        }

        if let Some(reason) = stop {
            debug!(task_id, ?reason, "Killing agent process");
            if let Err(e) = child.start_kill() {
                debug!(task_id, error = %e, "Agent process already exited");
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(exit)) => status = Some(exit),
                Ok(Err(e)) => warn!(task_id, error = %e, "Failed to reap agent process"),
                Err(_) => warn!(task_id, "Agent process did not exit after kill"),
            }
        }

        let timed_out = stop == Some(Stop::TimedOut);
        if timed_out {
            let secs = self.timeout.as_secs();
            warn!(task_id, timeout_secs = secs, "Agent timed out");
            self.emit(
                task_id,
                EventKind::Timeout {
                    message: format!("Agent exceeded {secs}s"),
                    timeout_secs: secs,
                },
            )
            .await;
        }

        // A cancel that raced the process exit still counts.
        let cancelled = stop == Some(Stop::Cancelled)
            || (!timed_out && (cancel.is_cancelled() || self.cancel_requested(task_id).await));
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);

        self.emit(
            task_id,
            EventKind::Result {
                exit_code,
                cancelled,
                timed_out,
            },
        )
        .await;
        info!(task_id, exit_code, cancelled, timed_out, "Agent process finished");

        Ok(RawRun {
            exit_code,
            text: collector.finish(),
            stderr: stderr_lines.join("\n"),
            cancelled,
            timed_out,
        })
    }
}
