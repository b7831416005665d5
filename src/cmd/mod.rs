//! CLI command implementations.
//!
//! | Module     | Commands handled                        |
//! |------------|-----------------------------------------|
//! | `serve`    | `Serve`                                 |
//! | `repos`    | `Repo`                                  |
//! | `tasks`    | `Task`, `Plan`                          |
//! | `views`    | `Board`, `Notifications`                |

pub mod repos;
pub mod serve;
pub mod tasks;
pub mod views;

pub use repos::cmd_repo;
pub use serve::cmd_serve;
pub use tasks::{cmd_plan, cmd_task};
pub use views::{cmd_board, cmd_notifications};

use anyhow::{Context, Result};
use serde::Serialize;

use repopilot::config::{Settings, resolve_root};
use repopilot::control::Control;
use repopilot::git::GitPipeline;
use repopilot::store::StoreHandle;

use crate::Cli;

/// Root from `--root`/`REPOPILOT_ROOT`, then file and environment settings,
/// then `--workers`.
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let root = resolve_root(cli.root.as_deref())?;
    Ok(Settings::load(&root)?.with_workers(cli.workers))
}

pub(crate) fn open_store(settings: &Settings) -> Result<StoreHandle> {
    settings.ensure_directories()?;
    StoreHandle::open(&settings.state_dir)
        .with_context(|| format!("Failed to open store at {}", settings.state_dir.display()))
}

/// Control for a one-shot CLI process. Running attempts belong to the
/// service, so cancellation goes through the task's cancel flag.
pub(crate) fn offline_control(settings: &Settings, store: &StoreHandle) -> Control {
    Control::new(store.clone(), GitPipeline::new(settings), None)
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
