//! Append-only, per-task event log stored as newline-delimited JSON under
//! `<state>/events/<task_id>.ndjson`.
//!
//! Each record carries a per-task sequence number starting at 1 and
//! increasing by one per append. Readers page through the log with a cursor
//! (the last sequence number they have seen).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::models::{StageKind, StepStatus, TaskStatus};

const EVENT_FILE_SUFFIX: &str = "ndjson";

/// Outcome of a workspace cleanup attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupResult {
    Success,
    Failed,
    SkipEmptyPath,
    SkipNoCurrentRun,
    RunNotFound,
    RepoNotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Command {
        cmd: String,
        workdir: String,
    },
    Stream {
        line: String,
        #[serde(default)]
        stderr: bool,
    },
    Result {
        exit_code: i32,
        #[serde(default)]
        cancelled: bool,
        #[serde(default)]
        timed_out: bool,
    },
    Timeout {
        message: String,
        timeout_secs: u64,
    },
    Artifact {
        path: String,
    },
    SessionCreated {
        session_id: String,
        message: String,
    },
    SessionResumed {
        session_id: String,
        message: String,
    },
    SessionResumeFailed {
        session_id: String,
        message: String,
        error_text: String,
    },
    SessionFallbackCreated {
        old_session_id: String,
        session_id: String,
        message: String,
    },
    AssistantText {
        text: String,
    },
    StrategyGenerated {
        message: String,
    },
    Stage {
        stage: StageKind,
        status: StepStatus,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        detail: Option<String>,
    },
    PrFallback {
        message: String,
        compare_url: Option<String>,
    },
    WorktreeCleanup {
        trigger_status: TaskStatus,
        result: CleanupResult,
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        worktree_path: Option<String>,
        #[serde(default)]
        branch_name: Option<String>,
        #[serde(default)]
        failed_step: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    CancelRequested {
        message: String,
    },
    PlanBatchConfirm {
        message: String,
    },
    PlanBatchRevise {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// One page of events returned by `EventLog::read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub next_cursor: u64,
}

#[derive(Debug, Clone, Copy)]
struct SeqCache {
    seq: u64,
    len: u64,
}

pub struct EventLog {
    dir: PathBuf,
    cache: Mutex<HashMap<String, SeqCache>>,
}

impl EventLog {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create events directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.{EVENT_FILE_SUFFIX}"))
    }

    /// Append one event and return its sequence number.
    pub fn append(&self, task_id: &str, kind: EventKind) -> Result<u64> {
        let path = self.path_for(task_id);
        let cached = self.cached(task_id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock event log {}", path.display()))?;

        // Another writer may have appended since the cached sequence was taken.
        let len = file.metadata()?.len();
        let last_seq = match cached {
            Some(cached) if cached.len == len => cached.seq,
            _ => max_seq_in(&path)?,
        };

        let event = Event {
            seq: last_seq + 1,
            ts: Utc::now(),
            kind,
        };
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.sync_data()?;

        let entry = SeqCache {
            seq: event.seq,
            len: len + line.len() as u64,
        };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(task_id) {
            Some(existing) if existing.seq >= entry.seq => {}
            _ => {
                cache.insert(task_id.to_string(), entry);
            }
        }
        Ok(event.seq)
    }

    fn cached(&self, task_id: &str) -> Option<SeqCache> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
    }

    /// Events with `seq > cursor`, at most `limit` of them.
    pub fn read(&self, task_id: &str, cursor: u64, limit: usize) -> Result<EventBatch> {
        let path = self.path_for(task_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(EventBatch {
                    events: Vec::new(),
                    next_cursor: cursor,
                });
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to open {}", path.display()));
            }
        };

        let mut events = Vec::new();
        if limit == 0 {
            return Ok(EventBatch {
                events,
                next_cursor: cursor,
            });
        }
        for line in BufReader::new(file).lines() {
            let line = line?;
            // A line that does not parse is either corrupt or still being written.
            let Ok(event) = serde_json::from_str::<Event>(&line) else {
                continue;
            };
            if event.seq > cursor {
                events.push(event);
                if events.len() >= limit {
                    break;
                }
            }
        }
        let next_cursor = events.last().map(|e| e.seq).unwrap_or(cursor);
        Ok(EventBatch {
            events,
            next_cursor,
        })
    }

    /// Every event of the task, oldest first.
    pub fn read_all(&self, task_id: &str) -> Result<Vec<Event>> {
        Ok(self.read(task_id, 0, usize::MAX)?.events)
    }

    /// Delete event logs not modified within `retention_days`. Returns the
    /// number of files removed. A retention of 0 disables cleanup.
    pub fn cleanup_old_logs(&self, retention_days: u64) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let pattern = self.dir.join(format!("*.{EVENT_FILE_SUFFIX}"));
        let pattern = pattern.to_string_lossy();

        let mut removed = 0;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        for entry in glob::glob(&pattern).context("Invalid event log pattern")? {
            let Ok(path) = entry else { continue };
            let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
                if let Some(task_id) = path.file_stem().and_then(|s| s.to_str()) {
                    cache.remove(task_id);
                }
            }
        }
        Ok(removed)
    }
}

fn max_seq_in(path: &Path) -> Result<u64> {
    #[derive(Deserialize)]
    struct SeqOnly {
        seq: u64,
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut max = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str::<SeqOnly>(&line) {
            max = max.max(record.seq);
        }
    }
    Ok(max)
}
