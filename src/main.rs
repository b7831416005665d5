use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repopilot::logging::{self, LogOptions};
use repopilot::models::{PermissionMode, TaskMode, TaskStatus};

mod cmd;

#[derive(Parser)]
#[command(name = "repopilot")]
#[command(version, about = "Coding-agent task orchestrator for local git repositories")]
pub struct Cli {
    /// Root directory holding repopilot.toml, repos/, state/ and worktrees/
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Number of scheduler workers (overrides config and REPOPILOT_WORKERS)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Print results as pretty JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Log filter used when RUST_LOG is not set (e.g. "debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs on stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C
    Serve,
    /// Manage registered repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Create, inspect and act on tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Act on several plans awaiting review at once
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Show tasks grouped by board column
    Board {
        #[arg(long)]
        repo: Option<String>,
    },
    /// List or acknowledge notifications
    Notifications {
        #[command(subcommand)]
        command: Option<NotificationCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum RepoCommands {
    List,
    /// Discover git repositories under the repos directory
    Rescan,
    /// Register one repository by path
    Add { path: PathBuf },
    /// Change repository settings
    Set {
        id: String,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        test_command: Option<String>,
        #[arg(long)]
        main_branch: Option<String>,
        /// `owner/repo`; an empty value clears it
        #[arg(long)]
        github_repo: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    Create {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "plan", value_parser = parse_mode)]
        mode: TaskMode,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value = "bypass", value_parser = parse_permission_mode)]
        permission_mode: PermissionMode,
    },
    List {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
        #[arg(long)]
        keyword: Option<String>,
    },
    Show { id: String },
    Cancel { id: String },
    Retry {
        id: String,
        /// Switch the task to this mode before requeueing
        #[arg(long, value_parser = parse_mode)]
        mode: Option<TaskMode>,
    },
    /// Mark a reviewed task done and remove its worktree
    Done { id: String },
    /// Confirm a plan; unanswered questions take the recommended option
    Confirm {
        id: String,
        /// `question_id=option_key`, repeatable
        #[arg(long = "answer", value_parser = parse_answer)]
        answers: Vec<(String, String)>,
    },
    /// Send a plan back with feedback
    Revise {
        id: String,
        #[arg(long)]
        feedback: String,
    },
    Events {
        id: String,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum PlanCommands {
    BatchConfirm {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    BatchRevise {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        feedback: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum NotificationCommands {
    List {
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Mark one notification read, or all of them without an id
    Read { id: Option<String> },
}

fn parse_mode(s: &str) -> Result<TaskMode, String> {
    s.to_uppercase().parse()
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    s.to_uppercase().replace('-', "_").parse()
}

fn parse_permission_mode(s: &str) -> Result<PermissionMode, String> {
    s.to_uppercase().parse()
}

fn parse_answer(s: &str) -> Result<(String, String), String> {
    let (question, option) = s
        .split_once('=')
        .ok_or_else(|| format!("expected question_id=option_key, got '{s}'"))?;
    let (question, option) = (question.trim(), option.trim());
    if question.is_empty() || option.is_empty() {
        return Err(format!("expected question_id=option_key, got '{s}'"));
    }
    Ok((question.to_string(), option.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = cmd::load_settings(&cli)?;

    let options = LogOptions {
        level: cli.log_level.clone(),
        json: cli.log_json,
    };
    let log_dir = matches!(cli.command, Commands::Serve).then(|| settings.service_log_dir());
    let _guard = logging::init(&options, log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve => cmd::cmd_serve(settings).await?,
        Commands::Repo { command } => cmd::cmd_repo(&settings, cli.json, command.clone()).await?,
        Commands::Task { command } => cmd::cmd_task(&settings, cli.json, command.clone()).await?,
        Commands::Plan { command } => cmd::cmd_plan(&settings, cli.json, command.clone()).await?,
        Commands::Board { repo } => cmd::cmd_board(&settings, cli.json, repo.as_deref())?,
        Commands::Notifications { command } => {
            cmd::cmd_notifications(&settings, cli.json, command.clone())?
        }
    }

    Ok(())
}
