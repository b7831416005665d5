//! Service assembly: store, runner, scheduler and the human-decision surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Settings;
use crate::control::Control;
use crate::runner::{AgentRunner, TaskRunner};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::StoreHandle;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Engine {
    settings: Settings,
    store: StoreHandle,
    runner: Arc<AgentRunner>,
    scheduler: Scheduler,
    control: Control,
}

impl Engine {
    pub fn open(settings: Settings) -> Result<Self> {
        settings.ensure_directories()?;
        let store = StoreHandle::open(&settings.state_dir)
            .with_context(|| format!("Failed to open store at {}", settings.state_dir.display()))?;
        let runner = Arc::new(AgentRunner::new(store.clone(), &settings));
        let dyn_runner: Arc<dyn TaskRunner> = runner.clone();
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::clone(&dyn_runner),
            SchedulerConfig::from_settings(&settings),
        );
        let control = Control::new(store.clone(), runner.pipeline().clone(), Some(dyn_runner));
        Ok(Self {
            settings,
            store,
            runner,
            scheduler,
            control,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Fail attempts a previous process left running, then start the workers.
    /// Returns the number of recovered tasks.
    pub async fn start(&mut self) -> Result<usize> {
        let recovered = self.runner.recover_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted tasks");
        }
        self.scheduler.start();
        Ok(recovered)
    }

    pub async fn stop(&mut self, grace: Duration) {
        self.scheduler.stop(grace).await;
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorCode, NewTask, RepoConfig, TaskMode, TaskStatus};
    use crate::testing::settings;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_recovers_stranded_tasks() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.workers = 1;
        let mut engine = Engine::open(settings).unwrap();
        let root = dir.path().join("repos/web");
        std::fs::create_dir_all(&root).unwrap();
        let store = engine.store().clone();
        store
            .blocking()
            .upsert_repo(RepoConfig::new("web", "web", root))
            .unwrap();
        store
            .blocking()
            .create_task(NewTask::new("web", "t", "p", TaskMode::Plan))
            .unwrap();
        let stranded = store
            .blocking()
            .claim_next_task("worker-9", None)
            .unwrap()
            .unwrap();

        assert_eq!(engine.start().await.unwrap(), 1);
        engine.stop(Duration::from_secs(5)).await;

        let task = store.blocking().require_task(&stranded.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_code, Some(ErrorCode::Interrupted));
        assert!(engine.settings().state_dir.join("tasks.json").exists());
    }
}
