//! Configuration loaded from `<root>/repopilot.toml`, environment variables
//! and CLI flags.
//!
//! ```toml
//! [paths]
//! repos_dir = "repos"
//! state_dir = "state"
//!
//! [scheduler]
//! workers = 3
//!
//! [agent]
//! claude_cmd = "claude"
//! timeout_secs = 2700
//!
//! [pipeline]
//! test_timeout_secs = 1200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "repopilot.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PathsSection {
    #[serde(default)]
    pub repos_dir: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub worktrees_dir: Option<String>,
    #[serde(default)]
    pub artifacts_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SchedulerSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_logs_retention_days")]
    pub logs_retention_days: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
}

fn default_workers() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_logs_retention_days() -> u64 {
    30
}

fn default_janitor_interval_secs() -> u64 {
    3600
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            logs_retention_days: default_logs_retention_days(),
            janitor_interval_secs: default_janitor_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentSection {
    /// Agent executable (`CLAUDE_CMD` → file → `claude`).
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

fn default_agent_timeout_secs() -> u64 {
    2700
}

fn default_cancel_poll_ms() -> u64 {
    1000
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            timeout_secs: default_agent_timeout_secs(),
            cancel_poll_ms: default_cancel_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PipelineSection {
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_git_cmd")]
    pub git_cmd: String,
    /// GitHub CLI executable (`GH_CMD` → file → `gh`).
    #[serde(default)]
    pub gh_cmd: Option<String>,
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
}

fn default_test_timeout_secs() -> u64 {
    1200
}

fn default_git_cmd() -> String {
    "git".to_string()
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout_secs(),
            git_cmd: default_git_cmd(),
            gh_cmd: None,
            github_api_url: default_github_api_url(),
        }
    }
}

/// On-disk form of `repopilot.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RepopilotToml {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl RepopilotToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse repopilot.toml")
    }

    /// Returns the default configuration if `<root>/repopilot.toml` does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize repopilot.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub repos_dir: PathBuf,
    pub state_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub workers: usize,
    pub poll_interval: Duration,
    pub logs_retention_days: u64,
    pub janitor_interval: Duration,
    pub claude_cmd: String,
    pub agent_timeout: Duration,
    pub cancel_poll: Duration,
    pub test_timeout: Duration,
    pub git_cmd: String,
    pub gh_cmd: String,
    pub github_token: Option<String>,
    pub github_api_url: String,
}

impl Settings {
    /// Load `<root>/repopilot.toml` and apply environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let toml = RepopilotToml::load_or_default(root)?;
        Ok(Self::from_toml(root, &toml))
    }

    pub fn from_toml(root: &Path, toml: &RepopilotToml) -> Self {
        let paths = &toml.paths;
        let state_dir = resolve_path(root, paths.state_dir.as_deref(), "state");
        let artifacts_dir = match paths.artifacts_dir.as_deref() {
            Some(dir) => resolve_path(root, Some(dir), "artifacts"),
            None => state_dir.join("artifacts"),
        };

        let workers = env_parse::<usize>("REPOPILOT_WORKERS").unwrap_or(toml.scheduler.workers);

        Self {
            root: root.to_path_buf(),
            repos_dir: resolve_path(root, paths.repos_dir.as_deref(), "repos"),
            worktrees_dir: resolve_path(root, paths.worktrees_dir.as_deref(), "worktrees"),
            state_dir,
            artifacts_dir,
            workers: workers.max(1),
            poll_interval: Duration::from_millis(toml.scheduler.poll_interval_ms.max(10)),
            logs_retention_days: toml.scheduler.logs_retention_days,
            janitor_interval: Duration::from_secs(toml.scheduler.janitor_interval_secs.max(1)),
            claude_cmd: env_string("CLAUDE_CMD")
                .or_else(|| toml.agent.claude_cmd.clone())
                .unwrap_or_else(|| "claude".to_string()),
            agent_timeout: Duration::from_secs(toml.agent.timeout_secs),
            cancel_poll: Duration::from_millis(toml.agent.cancel_poll_ms.max(10)),
            test_timeout: Duration::from_secs(toml.pipeline.test_timeout_secs),
            git_cmd: toml.pipeline.git_cmd.clone(),
            gh_cmd: env_string("GH_CMD")
                .or_else(|| toml.pipeline.gh_cmd.clone())
                .unwrap_or_else(|| "gh".to_string()),
            github_token: env_string("GITHUB_TOKEN"),
            github_api_url: toml.pipeline.github_api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        if let Some(workers) = workers {
            self.workers = workers.max(1);
        }
        self
    }

    pub fn events_dir(&self) -> PathBuf {
        self.state_dir.join("events")
    }

    pub fn service_log_dir(&self) -> PathBuf {
        self.state_dir.join("service-logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.repos_dir,
            &self.state_dir,
            &self.worktrees_dir,
            &self.artifacts_dir,
            &self.events_dir(),
            &self.service_log_dir(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Root directory from `--root`, then `REPOPILOT_ROOT`, then the current directory.
pub fn resolve_root(cli_root: Option<&Path>) -> Result<PathBuf> {
    let root = match cli_root {
        Some(root) => expand_home(&root.to_string_lossy()),
        None => match env_string("REPOPILOT_ROOT") {
            Some(root) => expand_home(&root),
            None => std::env::current_dir().context("Failed to read current directory")?,
        },
    };
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create root directory {}", root.display()))?;
    root.canonicalize()
        .with_context(|| format!("Failed to resolve root directory {}", root.display()))
}

fn resolve_path(root: &Path, value: Option<&str>, default: &str) -> PathBuf {
    let path = expand_home(value.unwrap_or(default));
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn expand_home(value: &str) -> PathBuf {
    if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}
