//! Applies IPC requests on behalf of a tenant
//!
//! Authorization is decided here, from the directory a file was found in, and
//! never from anything the record claims about itself. A non-privileged tenant
//! may only touch its own chat and its own tasks.

use anyhow::Result;
use chrono::Utc;
use corral_scheduler::{first_run, new_task_id, parse_schedule_type};
use corral_store::{ContextMode, RegisteredGroup, ScheduledTask, TaskStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::protocol::IpcRequest;
use super::watcher::IpcEnvelope;
use crate::orchestrator::{HostContext, validate_folder};

pub struct IpcDispatcher {
    ctx: Arc<HostContext>,
}

impl IpcDispatcher {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self { ctx }
    }

    /// Consume envelopes until `cancel` fires or every watcher is gone
    pub async fn run(&self, mut rx: mpsc::Receiver<IpcEnvelope>, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let result = self.dispatch(&envelope.source_folder, envelope.request).await;
            // The watcher may have shut down in between
            let _ = envelope.reply.send(result);
        }
        info!("IPC dispatcher stopped");
    }

    /// Apply one request from `source`. An error sends the file to `errors/`;
    /// refused requests are logged and count as handled.
    pub async fn dispatch(&self, source: &str, request: IpcRequest) -> Result<()> {
        let privileged = self.ctx.is_privileged(source);
        match request {
            IpcRequest::Message { chat_jid, text, .. } => {
                self.send_message(source, privileged, &chat_jid, &text).await
            }
            IpcRequest::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                group_folder,
            } => {
                self.schedule_task(
                    source,
                    privileged,
                    prompt,
                    &schedule_type,
                    schedule_value,
                    context_mode.as_deref(),
                    group_folder,
                )
                .await
            }
            IpcRequest::PauseTask { task_id } => {
                self.change_task(source, privileged, &task_id, TaskAction::Pause).await
            }
            IpcRequest::ResumeTask { task_id } => {
                self.change_task(source, privileged, &task_id, TaskAction::Resume).await
            }
            IpcRequest::CancelTask { task_id } => {
                self.change_task(source, privileged, &task_id, TaskAction::Cancel).await
            }
            IpcRequest::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
            } => {
                if !privileged {
                    warn!("Unauthorized register_group attempt from {}", source);
                    return Ok(());
                }
                validate_folder(&folder)?;
                self.ctx
                    .register_group(RegisteredGroup {
                        chat_id: jid,
                        name,
                        folder,
                        trigger,
                        added_at: Utc::now(),
                        container_config: None,
                    })
                    .await
            }
            IpcRequest::RefreshGroups {} => {
                if !privileged {
                    warn!("Unauthorized refresh_groups attempt from {}", source);
                    return Ok(());
                }
                info!("Group snapshot refresh requested by {}", source);
                self.ctx.write_groups_snapshot(source).await
            }
        }
    }

    async fn send_message(&self, source: &str, privileged: bool, chat_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            warn!("Ignoring empty IPC message from {}", source);
            return Ok(());
        }
        let target = self.ctx.store.get_group(chat_id).await?;
        let owns_chat = target.as_ref().is_some_and(|g| g.folder == source);
        if !privileged && !owns_chat {
            warn!("Unauthorized IPC message to {} from {}", chat_id, source);
            return Ok(());
        }

        let id = format!("bot-ipc-{}", uuid::Uuid::new_v4().simple());
        self.ctx.send_message(chat_id, text, id).await?;
        info!("IPC message from {} delivered to {}", source, chat_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn schedule_task(
        &self,
        source: &str,
        privileged: bool,
        prompt: String,
        schedule_type: &str,
        schedule_value: String,
        context_mode: Option<&str>,
        group_folder: Option<String>,
    ) -> Result<()> {
        let target = group_folder.unwrap_or_else(|| source.to_string());
        if !privileged && target != source {
            warn!("Unauthorized schedule_task from {} targeting {}", source, target);
            return Ok(());
        }
        if prompt.trim().is_empty() {
            warn!("Rejected schedule_task from {}: empty prompt", source);
            return Ok(());
        }

        let Some(group) = self.ctx.store.group_by_folder(&target).await? else {
            warn!("Cannot schedule task: group {} is not registered", target);
            return Ok(());
        };

        let schedule_type = match parse_schedule_type(schedule_type) {
            Ok(t) => t,
            Err(e) => {
                warn!("Rejected schedule_task from {}: {}", source, e);
                return Ok(());
            }
        };
        let now = Utc::now();
        let next_run = match first_run(schedule_type, &schedule_value, now, self.ctx.timezone) {
            Ok(next) => next,
            Err(e) => {
                warn!("Rejected schedule_task from {}: {}", source, e);
                return Ok(());
            }
        };

        let context_mode = context_mode
            .and_then(|m| m.parse::<ContextMode>().ok())
            .unwrap_or_default();

        let task = ScheduledTask {
            id: new_task_id(),
            group_folder: target.clone(),
            chat_id: group.chat_id,
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            next_run: Some(next_run),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now,
        };
        let id = task.id.clone();
        self.ctx.store.create_task(task).await?;
        info!(
            "Task {} created via IPC by {} for {} (next run {})",
            id, source, target, next_run
        );
        Ok(())
    }

    async fn change_task(
        &self,
        source: &str,
        privileged: bool,
        task_id: &str,
        action: TaskAction,
    ) -> Result<()> {
        let task = self.ctx.store.get_task(task_id).await?;
        let Some(task) = task.filter(|t| privileged || t.group_folder == source) else {
            warn!("Unauthorized or unknown {:?} of task {} from {}", action, task_id, source);
            return Ok(());
        };

        match action {
            TaskAction::Pause if task.status == TaskStatus::Active => {
                self.ctx.store.update_task_status(task_id, TaskStatus::Paused).await?;
                info!("Task {} paused by {}", task_id, source);
            }
            TaskAction::Resume if task.status == TaskStatus::Paused => {
                self.ctx.store.update_task_status(task_id, TaskStatus::Active).await?;
                info!("Task {} resumed by {}", task_id, source);
            }
            TaskAction::Cancel => {
                self.ctx.store.delete_task(task_id).await?;
                info!("Task {} cancelled by {}", task_id, source);
            }
            _ => {
                warn!(
                    "Ignoring {:?} of task {} in status {}",
                    action, task_id, task.status
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskAction {
    Pause,
    Resume,
    Cancel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::watcher::IpcWatcher;
    use crate::ipc::writer::IpcWriter;
    use crate::orchestrator::tests::{FakeRunner, RecordingChannel, group, test_context};
    use crate::sandbox::ContainerOutput;
    use corral_store::ScheduleType;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        ctx: Arc<HostContext>,
        channel: Arc<RecordingChannel>,
        dispatcher: IpcDispatcher,
    }

    async fn fixture() -> Fixture {
        fixture_with_channel(RecordingChannel::default()).await
    }

    async fn fixture_with_channel(channel: RecordingChannel) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(channel);
        let runner = FakeRunner::replying(ContainerOutput::success(None));
        let ctx = test_context(tmp.path(), runner, channel.clone());
        ctx.register_group(group("!main:x", "main")).await.unwrap();
        ctx.register_group(group("!team:x", "team")).await.unwrap();
        ctx.register_group(group("!other:x", "other")).await.unwrap();
        Fixture {
            _tmp: tmp,
            dispatcher: IpcDispatcher::new(ctx.clone()),
            ctx,
            channel,
        }
    }

    fn schedule(value: &str, kind: &str, folder: Option<&str>) -> IpcRequest {
        IpcRequest::ScheduleTask {
            prompt: "check the build".to_string(),
            schedule_type: kind.to_string(),
            schedule_value: value.to_string(),
            context_mode: None,
            group_folder: folder.map(str::to_string),
        }
    }

    fn message(chat: &str, text: &str) -> IpcRequest {
        IpcRequest::Message {
            chat_jid: chat.to_string(),
            text: text.to_string(),
            group_folder: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_message_authorization() -> Result<()> {
        let f = fixture().await;
        f.dispatcher.dispatch("team", message("!team:x", "own chat")).await?;
        f.dispatcher.dispatch("team", message("!other:x", "sneaky")).await?;
        f.dispatcher.dispatch("main", message("!other:x", "from main")).await?;

        let sent = f.channel.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("!team:x".to_string(), "own chat".to_string()),
                ("!other:x".to_string(), "from main".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_message_send_failure_propagates() -> Result<()> {
        let f = fixture_with_channel(RecordingChannel {
            fail: true,
            ..Default::default()
        })
        .await;
        assert!(f.dispatcher.dispatch("team", message("!team:x", "hi")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_schedule_task_defaults_to_source() -> Result<()> {
        let f = fixture().await;
        let before = Utc::now();
        f.dispatcher.dispatch("team", schedule("300000", "interval", None)).await?;

        let tasks = f.ctx.store.list_tasks_for_group("team").await?;
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.chat_id, "!team:x");
        assert_eq!(task.schedule_type, ScheduleType::Interval);
        assert_eq!(task.context_mode, ContextMode::Isolated);
        let delta = (task.next_run.unwrap() - before).num_milliseconds();
        assert!((300_000..305_000).contains(&delta));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_cron_creates_no_task() -> Result<()> {
        let f = fixture().await;
        f.dispatcher.dispatch("team", schedule("not a cron", "cron", None)).await?;
        f.dispatcher.dispatch("team", schedule("0", "interval", None)).await?;
        f.dispatcher.dispatch("team", schedule("whenever", "once", None)).await?;
        f.dispatcher.dispatch("team", schedule("60000", "weekly", None)).await?;
        assert!(f.ctx.store.list_tasks().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_range_schedules_are_refused() -> Result<()> {
        let f = fixture().await;
        f.dispatcher
            .dispatch("team", schedule("9223372036854775807", "interval", None))
            .await?;
        f.dispatcher
            .dispatch("team", schedule("300000000000000", "interval", None))
            .await?;
        assert!(f.ctx.store.list_tasks().await?.is_empty());
        assert!(f.ctx.store.due_tasks(Utc::now()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cross_tenant_schedule_rules() -> Result<()> {
        let f = fixture().await;
        f.dispatcher.dispatch("team", schedule("60000", "interval", Some("other"))).await?;
        assert!(f.ctx.store.list_tasks().await?.is_empty());

        f.dispatcher.dispatch("main", schedule("0 9 * * 1", "cron", Some("other"))).await?;
        let tasks = f.ctx.store.list_tasks_for_group("other").await?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chat_id, "!other:x");

        // Unregistered target
        f.dispatcher.dispatch("main", schedule("60000", "interval", Some("ghost"))).await?;
        assert_eq!(f.ctx.store.list_tasks().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_authorization() -> Result<()> {
        let f = fixture().await;
        f.dispatcher.dispatch("other", schedule("60000", "interval", None)).await?;
        let id = f.ctx.store.list_tasks().await?[0].id.clone();

        f.dispatcher.dispatch("team", IpcRequest::PauseTask { task_id: id.clone() }).await?;
        assert_eq!(f.ctx.store.get_task(&id).await?.unwrap().status, TaskStatus::Active);

        f.dispatcher.dispatch("other", IpcRequest::PauseTask { task_id: id.clone() }).await?;
        assert_eq!(f.ctx.store.get_task(&id).await?.unwrap().status, TaskStatus::Paused);

        f.dispatcher.dispatch("main", IpcRequest::ResumeTask { task_id: id.clone() }).await?;
        assert_eq!(f.ctx.store.get_task(&id).await?.unwrap().status, TaskStatus::Active);

        f.dispatcher.dispatch("team", IpcRequest::CancelTask { task_id: id.clone() }).await?;
        assert!(f.ctx.store.get_task(&id).await?.is_some());

        f.dispatcher.dispatch("other", IpcRequest::CancelTask { task_id: id.clone() }).await?;
        assert!(f.ctx.store.get_task(&id).await?.is_none());

        // Unknown ids are refused quietly
        f.dispatcher.dispatch("main", IpcRequest::PauseTask { task_id: "nope".to_string() }).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_register_and_refresh_are_privileged() -> Result<()> {
        let f = fixture().await;
        let register = |folder: &str| IpcRequest::RegisterGroup {
            jid: "!new:x".to_string(),
            name: "New".to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
        };

        f.dispatcher.dispatch("team", register("newbie")).await?;
        assert!(f.ctx.store.get_group("!new:x").await?.is_none());

        assert!(f.dispatcher.dispatch("main", register("../../etc")).await.is_err());

        f.dispatcher.dispatch("main", register("newbie")).await?;
        assert_eq!(f.ctx.store.get_group("!new:x").await?.unwrap().folder, "newbie");

        let snapshot = f.ctx.paths.ipc_dir().join("team").join("available_groups.json");
        f.dispatcher.dispatch("team", IpcRequest::RefreshGroups {}).await?;
        assert!(!snapshot.exists());

        f.ctx.store.upsert_chat("!new:x", Some("New"), "2026-01-01T00:00:00.000Z").await?;
        f.dispatcher.dispatch("main", IpcRequest::RefreshGroups {}).await?;
        let path = f.ctx.paths.ipc_dir().join("main").join("available_groups.json");
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
        assert_eq!(value["groups"][0]["jid"], "!new:x");
        assert_eq!(value["groups"][0]["isRegistered"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_watcher_and_dispatcher_end_to_end() -> Result<()> {
        let f = fixture().await;
        let ipc_dir = f.ctx.paths.ipc_dir();
        let writer = IpcWriter::new(ipc_dir.join("team"));
        writer.send(&schedule("not a cron", "cron", None)).await?;
        writer.send(&schedule("60000", "interval", None)).await?;
        writer.send(&message("!team:x", "done")).await?;

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let dispatcher = IpcDispatcher::new(f.ctx.clone());
        let dispatch_cancel = cancel.clone();
        let handle = tokio::spawn(async move { dispatcher.run(rx, dispatch_cancel).await });

        let watcher = IpcWatcher::new(ipc_dir.clone(), Duration::from_millis(10), tx);
        assert_eq!(watcher.poll_once().await?, 3);
        cancel.cancel();
        handle.await?;

        let tasks = f.ctx.store.list_tasks().await?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].schedule_value, "60000");
        assert_eq!(f.channel.sent.lock().unwrap().len(), 1);
        assert!(std::fs::read_dir(ipc_dir.join("team/tasks"))?.next().is_none());
        assert!(!ipc_dir.join("errors").exists());
        Ok(())
    }
}
