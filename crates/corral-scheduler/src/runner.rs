//! Polling scheduler loop
//!
//! Every poll interval the loop asks the store for due tasks, re-reads each one
//! to make sure it is still active, hands it to a [`TaskExecutor`] and then
//! records the run and the next occurrence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use corral_store::{RunStatus, ScheduledTask, Store, TaskRunLog, TaskStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::schedule::{next_run_after, summarize_result};

/// Outcome of one scheduled execution, reported as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Option<String>),
    Failed(String),
}

/// Runs the body of a due task (normally inside a sandbox)
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ScheduledTask) -> TaskOutcome;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            timezone: Tz::UTC,
        }
    }
}

pub struct Scheduler {
    store: Store,
    executor: Arc<dyn TaskExecutor>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Store, executor: Arc<dyn TaskExecutor>, config: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Scheduler loop started (poll every {:?}, tz {})",
            self.config.poll_interval, self.config.timezone
        );

        loop {
            if let Err(e) = self.tick().await {
                error!("Error in scheduler loop: {:#}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Scheduler loop stopped");
    }

    /// One polling cycle. Returns how many tasks were executed.
    pub async fn tick(&self) -> Result<usize> {
        let due = self.store.due_tasks(Utc::now()).await?;
        if due.is_empty() {
            return Ok(0);
        }
        info!("Found {} due task(s)", due.len());

        let mut executed = 0;
        for candidate in due {
            // A pause or cancel may have landed since the due query
            let current = match self.store.get_task(&candidate.id).await {
                Ok(Some(task)) if task.status == TaskStatus::Active => task,
                Ok(_) => {
                    debug!("Skipping task {}: no longer active", candidate.id);
                    continue;
                }
                Err(e) => {
                    error!("Failed to reload task {}: {:#}", candidate.id, e);
                    continue;
                }
            };

            match self.run_task(current).await {
                Ok(()) => executed += 1,
                Err(e) => error!("Task {} failed: {:#}", candidate.id, e),
            }
        }

        Ok(executed)
    }

    async fn run_task(&self, task: ScheduledTask) -> Result<()> {
        info!("Running scheduled task {} (group {})", task.id, task.group_folder);
        let started = Instant::now();
        let run_at = Utc::now();

        let outcome = self.executor.execute(&task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result, error) = match outcome {
            TaskOutcome::Success(result) => (result, None),
            TaskOutcome::Failed(error) => (None, Some(error)),
        };

        match &error {
            Some(e) => warn!("Task {} finished with error after {}ms: {}", task.id, duration_ms, e),
            None => info!("Task {} completed in {}ms", task.id, duration_ms),
        }

        self.store
            .log_task_run(TaskRunLog {
                task_id: task.id.clone(),
                run_at,
                duration_ms,
                status: if error.is_some() {
                    RunStatus::Error
                } else {
                    RunStatus::Success
                },
                result: result.clone(),
                error: error.clone(),
            })
            .await?;

        let finished = Utc::now();
        let next_run = match next_run_after(
            task.schedule_type,
            &task.schedule_value,
            finished,
            self.config.timezone,
        ) {
            Ok(next) => next,
            Err(e) => {
                error!("Task {} has an unusable schedule, completing it: {}", task.id, e);
                None
            }
        };

        let summary = summarize_result(result.as_deref(), error.as_deref());
        self.store
            .update_task_after_run(&task.id, next_run, &summary, finished)
            .await?;

        if next_run.is_none() {
            info!("Task {} completed, no further runs", task.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use corral_store::{ContextMode, ScheduleType};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("corral.db")).unwrap();
        (dir, store)
    }

    fn due_task(id: &str, schedule_type: ScheduleType, value: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: "main".to_string(),
            chat_id: "!r:x".to_string(),
            prompt: "do the thing".to_string(),
            schedule_type,
            schedule_value: value.to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some(Utc::now() - ChronoDuration::seconds(1)),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Records executions and optionally pauses another task mid-cycle
    struct RecordingExecutor {
        store: Store,
        executed: Mutex<Vec<String>>,
        pause_on_run: Option<(String, String)>,
        outcome: TaskOutcome,
    }

    impl RecordingExecutor {
        fn new(store: Store, outcome: TaskOutcome) -> Self {
            Self {
                store,
                executed: Mutex::new(Vec::new()),
                pause_on_run: None,
                outcome,
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, task: &ScheduledTask) -> TaskOutcome {
            self.executed.lock().unwrap().push(task.id.clone());
            if let Some((trigger, victim)) = &self.pause_on_run
                && trigger == &task.id
            {
                self.store
                    .update_task_status(victim, TaskStatus::Paused)
                    .await
                    .unwrap();
            }
            self.outcome.clone()
        }
    }

    fn scheduler(store: &Store, executor: Arc<dyn TaskExecutor>) -> Scheduler {
        Scheduler::new(store.clone(), executor, SchedulerConfig::default())
    }

    fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
        let delta = (actual - expected).num_milliseconds().abs();
        assert!(delta < 5_000, "expected {expected}, got {actual}");
    }

    #[tokio::test]
    async fn test_task_paused_mid_cycle_is_not_executed() -> Result<()> {
        let (_dir, store) = open_store();
        let mut first = due_task("a", ScheduleType::Interval, "60000");
        first.next_run = Some(Utc::now() - ChronoDuration::seconds(10));
        store.create_task(first).await?;
        store.create_task(due_task("b", ScheduleType::Interval, "60000")).await?;

        let mut executor = RecordingExecutor::new(store.clone(), TaskOutcome::Success(None));
        executor.pause_on_run = Some(("a".to_string(), "b".to_string()));
        let executor = Arc::new(executor);

        let executed = scheduler(&store, executor.clone()).tick().await?;
        assert_eq!(executed, 1);
        assert_eq!(executor.executed(), vec!["a".to_string()]);

        let b = store.get_task("b").await?.unwrap();
        assert_eq!(b.status, TaskStatus::Paused);
        assert!(b.last_run.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_interval_task_rescheduled() -> Result<()> {
        let (_dir, store) = open_store();
        store.create_task(due_task("t", ScheduleType::Interval, "300000")).await?;
        let executor = Arc::new(RecordingExecutor::new(
            store.clone(),
            TaskOutcome::Success(Some("pong".to_string())),
        ));

        let before = Utc::now();
        scheduler(&store, executor).tick().await?;

        let task = store.get_task("t").await?.unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_close(task.next_run.unwrap(), before + ChronoDuration::milliseconds(300_000));
        assert_eq!(task.last_result.as_deref(), Some("pong"));

        let logs = store.task_run_logs("t", 10).await?;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_cron_task_rescheduled_after_now() -> Result<()> {
        let (_dir, store) = open_store();
        store.create_task(due_task("c", ScheduleType::Cron, "* * * * *")).await?;
        let executor = Arc::new(RecordingExecutor::new(store.clone(), TaskOutcome::Success(None)));

        let before = Utc::now();
        scheduler(&store, executor).tick().await?;

        let task = store.get_task("c").await?.unwrap();
        let next = task.next_run.unwrap();
        assert!(next > before);
        assert!(next - before <= ChronoDuration::seconds(61));
        assert_eq!(task.last_result.as_deref(), Some("Completed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_once_task_completes() -> Result<()> {
        let (_dir, store) = open_store();
        store.create_task(due_task("o", ScheduleType::Once, "2026-01-01T00:00:00Z")).await?;
        let executor = Arc::new(RecordingExecutor::new(store.clone(), TaskOutcome::Success(None)));

        scheduler(&store, executor.clone()).tick().await?;
        let task = store.get_task("o").await?.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.next_run.is_none());

        // A completed task is never due again
        assert_eq!(scheduler(&store, executor).tick().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_run_is_logged_and_loop_continues() -> Result<()> {
        let (_dir, store) = open_store();
        store.create_task(due_task("x", ScheduleType::Interval, "60000")).await?;
        store.create_task(due_task("y", ScheduleType::Interval, "60000")).await?;
        let executor = Arc::new(RecordingExecutor::new(
            store.clone(),
            TaskOutcome::Failed("Container timed out after 300000ms".to_string()),
        ));

        let executed = scheduler(&store, executor.clone()).tick().await?;
        assert_eq!(executed, 2);
        assert_eq!(executor.executed().len(), 2);

        let x = store.get_task("x").await?.unwrap();
        assert!(x.last_result.unwrap().starts_with("Error: Container timed out"));
        let logs = store.task_run_logs("x", 10).await?;
        assert_eq!(logs[0].status, RunStatus::Error);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_dir, store) = open_store();
        let executor = Arc::new(RecordingExecutor::new(store.clone(), TaskOutcome::Success(None)));
        let sched = scheduler(&store, executor);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), sched.run(cancel))
            .await
            .expect("scheduler should stop when cancelled");
    }
}
