//! Bounded pool of worker loops that claim tasks and hand them to a runner.
//!
//! Workers never coordinate with each other: at-most-one ownership of a task
//! comes entirely from `JsonStore::claim_next_task`. Each claimed task runs
//! in its own tokio task, so a panicking attempt is caught at the join and
//! the task is failed with `SCHEDULER_CRASH` instead of taking the worker
//! down with it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::models::{ErrorCode, Task};
use crate::runner::TaskRunner;
use crate::store::StoreHandle;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub janitor_interval: Duration,
    pub logs_retention_days: u64,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            poll_interval: settings.poll_interval,
            janitor_interval: settings.janitor_interval,
            logs_retention_days: settings.logs_retention_days,
        }
    }
}

pub struct Scheduler {
    store: StoreHandle,
    runner: Arc<dyn TaskRunner>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: StoreHandle, runner: Arc<dyn TaskRunner>, config: SchedulerConfig) -> Self {
        Self {
            store,
            runner,
            config,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawn the worker loops and the janitor. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        info!(workers = self.config.workers, "Starting scheduler");
        for idx in 0..self.config.workers {
            let worker = Worker {
                id: format!("worker-{idx}"),
                store: self.store.clone(),
                runner: Arc::clone(&self.runner),
                poll_interval: self.config.poll_interval,
                shutdown: self.shutdown.clone(),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }
        self.handles.push(tokio::spawn(janitor(
            self.store.clone(),
            self.config.janitor_interval,
            self.config.logs_retention_days,
            self.shutdown.clone(),
        )));
    }

    /// Stop claiming, interrupt in-flight attempts and wait up to `grace` for
    /// every loop to finish. Loops still running after that are aborted.
    pub async fn stop(&mut self, grace: Duration) {
        info!("Stopping scheduler");
        self.shutdown.cancel();
        self.runner.interrupt_all().await;
        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Scheduler loops did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

struct Worker {
    id: String,
    store: StoreHandle,
    runner: Arc<dyn TaskRunner>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!(worker_id = %self.id, "Worker loop started");
        while !self.shutdown.is_cancelled() {
            let id = self.id.clone();
            match self.store.call(move |s| s.claim_next_task(&id, None)).await {
                Ok(Some(task)) => {
                    self.execute(task).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker_id = %self.id, error = %e, "Claim failed"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker_id = %self.id, "Worker loop stopped");
    }

    async fn execute(&self, task: Task) {
        info!(worker_id = %self.id, task_id = %task.id, mode = %task.mode, "Task claimed");
        let task_id = task.id.clone();
        let runner = Arc::clone(&self.runner);
        let worker_id = self.id.clone();
        let attempt = tokio::spawn(async move { runner.run_task(task, &worker_id).await });

        let message = match attempt.await {
            Ok(Ok(())) => {
                debug!(worker_id = %self.id, task_id = %task_id, "Attempt finished");
                return;
            }
            Ok(Err(e)) => {
                error!(worker_id = %self.id, task_id = %task_id, error = ?e, "Attempt failed");
                format!("{e:#}")
            }
            Err(join) => {
                error!(worker_id = %self.id, task_id = %task_id, error = %join, "Attempt crashed");
                join.to_string()
            }
        };
        if let Err(e) = self
            .runner
            .recover(&task_id, ErrorCode::SchedulerCrash, &message)
            .await
        {
            error!(worker_id = %self.id, task_id = %task_id, error = ?e, "Failed to mark crashed task");
        }
    }
}

async fn janitor(
    store: StoreHandle,
    interval: Duration,
    retention_days: u64,
    shutdown: CancellationToken,
) {
    loop {
        match store
            .call(move |s| s.events().cleanup_old_logs(retention_days))
            .await
        {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Old event logs removed"),
            Err(e) => warn!(error = %e, "Event log cleanup failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, TaskMode, TaskStatus};
    use crate::store::tests::store_with_repo;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records every call; panics on tasks titled "boom".
    #[derive(Default)]
    struct MockTaskRunner {
        runs: Mutex<Vec<(String, String)>>,
        recovered: Mutex<Vec<(String, ErrorCode)>>,
        interrupt_calls: Mutex<usize>,
    }

    #[async_trait]
    impl TaskRunner for MockTaskRunner {
        async fn run_task(&self, task: Task, worker_id: &str) -> Result<()> {
            if task.title == "boom" {
                panic!("runner exploded");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.runs
                .lock()
                .unwrap()
                .push((task.id.clone(), worker_id.to_string()));
            if task.title == "error" {
                anyhow::bail!("store went away");
            }
            Ok(())
        }

        async fn cancel(&self, _task_id: &str) -> bool {
            false
        }

        async fn interrupt_all(&self) {
            *self.interrupt_calls.lock().unwrap() += 1;
        }

        async fn recover(&self, task_id: &str, code: ErrorCode, _message: &str) -> Result<()> {
            self.recovered
                .lock()
                .unwrap()
                .push((task_id.to_string(), code));
            Ok(())
        }
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            poll_interval: Duration::from_millis(20),
            janitor_interval: Duration::from_secs(3600),
            logs_retention_days: 30,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_partition_tasks() {
        let dir = tempdir().unwrap();
        let store = StoreHandle::new(store_with_repo(dir.path()));
        let mut ids = HashSet::new();
        for i in 0..24 {
            let mode = if i % 2 == 0 { TaskMode::Plan } else { TaskMode::Exec };
            let task = store
                .blocking()
                .create_task(NewTask::new("web", &format!("t{i}"), "p", mode))
                .unwrap();
            ids.insert(task.id);
        }

        let runner = Arc::new(MockTaskRunner::default());
        let mut scheduler = Scheduler::new(store.clone(), runner.clone(), config(4));
        scheduler.start();
        scheduler.start();
        wait_for(|| runner.runs.lock().unwrap().len() >= 24).await;
        scheduler.stop(Duration::from_secs(5)).await;

        let runs = runner.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 24);
        let seen: HashSet<String> = runs.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(seen, ids);
        let workers: HashSet<&str> = runs.iter().map(|(_, w)| w.as_str()).collect();
        assert!(workers.iter().all(|w| w.starts_with("worker-")));
        assert!(workers.len() <= 4);

        for task in store.blocking().list_tasks(&Default::default()).unwrap() {
            assert!(task.status.is_running(), "{} is {}", task.id, task.status);
        }
        assert_eq!(*runner.interrupt_calls.lock().unwrap(), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_recovered_as_crash() {
        let dir = tempdir().unwrap();
        let store = StoreHandle::new(store_with_repo(dir.path()));
        let boom = store
            .blocking()
            .create_task(NewTask::new("web", "boom", "p", TaskMode::Exec).priority(5))
            .unwrap();
        let error = store
            .blocking()
            .create_task(NewTask::new("web", "error", "p", TaskMode::Exec))
            .unwrap();
        let fine = store
            .blocking()
            .create_task(NewTask::new("web", "fine", "p", TaskMode::Exec))
            .unwrap();

        let runner = Arc::new(MockTaskRunner::default());
        let mut scheduler = Scheduler::new(store.clone(), runner.clone(), config(1));
        scheduler.start();
        wait_for(|| runner.runs.lock().unwrap().len() >= 2).await;
        scheduler.stop(Duration::from_secs(5)).await;

        let recovered = runner.recovered.lock().unwrap().clone();
        assert_eq!(
            recovered,
            vec![
                (boom.id.clone(), ErrorCode::SchedulerCrash),
                (error.id.clone(), ErrorCode::SchedulerCrash)
            ]
        );
        let runs = runner.runs.lock().unwrap().clone();
        assert!(runs.iter().any(|(id, _)| *id == fine.id));
    }

    #[tokio::test]
    async fn test_disabled_repo_tasks_are_not_claimed() {
        let dir = tempdir().unwrap();
        let store = StoreHandle::new(store_with_repo(dir.path()));
        let task = store
            .blocking()
            .create_task(NewTask::new("web", "t", "p", TaskMode::Exec))
            .unwrap();
        store
            .blocking()
            .patch_repo(
                "web",
                crate::models::RepoPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let runner = Arc::new(MockTaskRunner::default());
        let mut scheduler = Scheduler::new(store.clone(), runner.clone(), config(2));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop(Duration::from_secs(5)).await;

        assert!(runner.runs.lock().unwrap().is_empty());
        assert_eq!(
            store.blocking().require_task(&task.id).unwrap().status,
            TaskStatus::Todo
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_interrupts_running_attempts() {
        let dir = tempdir().unwrap();
        let root = crate::git::testing::repo_with_origin(dir.path(), "web");
        let mut settings = crate::testing::settings(dir.path());
        settings.claude_cmd = crate::testing::write_script(&dir.path().join("claude"), "sleep 30")
            .to_string_lossy()
            .into_owned();
        let store = StoreHandle::open(&settings.state_dir).unwrap();
        store
            .blocking()
            .upsert_repo(crate::models::RepoConfig::new("web", "web", root))
            .unwrap();
        let task = store
            .blocking()
            .create_task(NewTask::new("web", "Long edit", "p", TaskMode::Exec))
            .unwrap();

        let runner = Arc::new(crate::runner::AgentRunner::new(store.clone(), &settings));
        let mut scheduler = Scheduler::new(store.clone(), runner, config(1));
        scheduler.start();
        wait_for(|| {
            store.blocking().require_task(&task.id).unwrap().status == TaskStatus::Running
        })
        .await;
        scheduler.stop(Duration::from_secs(10)).await;

        let task = store.blocking().require_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_code, Some(ErrorCode::Interrupted));
        let notes = store.blocking().list_notifications(false, 10).unwrap();
        assert!(notes.iter().all(|n| !n.title.starts_with("Task cancelled")));
    }
}
