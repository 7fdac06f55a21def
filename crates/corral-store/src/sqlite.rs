//! SQLite database layer for the supervisor's durable state

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::models::{
    ChatInfo, ContainerConfig, RegisteredGroup, ScheduledTask, StoredMessage, TaskRunLog,
    TaskStatus, format_timestamp, parse_timestamp,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chats (
    chat_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    last_message_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    is_from_me INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, chat_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_time ON messages(chat_id, timestamp);

CREATE TABLE IF NOT EXISTS registered_groups (
    chat_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    folder TEXT NOT NULL UNIQUE,
    trigger TEXT NOT NULL,
    added_at TEXT NOT NULL,
    container_config TEXT
);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id TEXT PRIMARY KEY,
    group_folder TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    schedule_value TEXT NOT NULL,
    context_mode TEXT NOT NULL DEFAULT 'isolated',
    next_run TEXT,
    last_run TEXT,
    last_result TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

CREATE TABLE IF NOT EXISTS task_run_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    run_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_run_logs ON task_run_logs(task_id, run_at);

CREATE TABLE IF NOT EXISTS sessions (
    group_folder TEXT PRIMARY KEY,
    session_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS router_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const TASK_COLUMNS: &str = "id, group_folder, chat_id, prompt, schedule_type, schedule_value, \
     context_mode, next_run, last_run, last_result, status, created_at";

/// SQLite store (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {:?}", parent))?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        info!("Initializing store at {:?}", path);

        conn.execute_batch(SCHEMA)
            .context("Failed to apply store schema")?;
        debug!("Store schema initialized successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&conn)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    // ── Chats and messages ─────────────────────────────────────────

    /// Record chat activity, keeping an existing name when `name` is `None`
    pub async fn upsert_chat(
        &self,
        chat_id: &str,
        name: Option<&str>,
        last_message_time: &str,
    ) -> Result<()> {
        let chat_id = chat_id.to_owned();
        let name = name.map(str::to_owned);
        let last_message_time = last_message_time.to_owned();

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO chats (chat_id, name, last_message_time) VALUES (?1, COALESCE(?2, ?1), ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    name = COALESCE(?2, chats.name),
                    last_message_time = MAX(chats.last_message_time, ?3)",
                params![&chat_id, name, &last_message_time],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatInfo>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, name, last_message_time FROM chats ORDER BY last_message_time DESC",
            )?;
            let chats = stmt
                .query_map([], |row| {
                    Ok(ChatInfo {
                        chat_id: row.get(0)?,
                        name: row.get(1)?,
                        last_message_time: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chats)
        })
        .await
    }

    pub async fn store_message(&self, message: StoredMessage) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages
                    (id, chat_id, sender, sender_name, content, timestamp, is_from_me)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &message.id,
                    &message.chat_id,
                    &message.sender,
                    &message.sender_name,
                    &message.content,
                    &message.timestamp,
                    message.is_from_me as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Messages strictly newer than `since`, oldest first
    pub async fn messages_since(&self, chat_id: &str, since: &str) -> Result<Vec<StoredMessage>> {
        let chat_id = chat_id.to_owned();
        let since = since.to_owned();

        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, sender, sender_name, content, timestamp, is_from_me
                 FROM messages
                 WHERE chat_id = ?1 AND timestamp > ?2
                 ORDER BY timestamp",
            )?;
            let messages = stmt
                .query_map(params![&chat_id, &since], Self::row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// The latest `limit` messages, oldest first
    pub async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let chat_id = chat_id.to_owned();

        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, sender, sender_name, content, timestamp, is_from_me
                 FROM messages
                 WHERE chat_id = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2",
            )?;
            let mut messages = stmt
                .query_map(params![&chat_id, limit as i64], Self::row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            sender: row.get(2)?,
            sender_name: row.get(3)?,
            content: row.get(4)?,
            timestamp: row.get(5)?,
            is_from_me: row.get::<_, i64>(6)? != 0,
        })
    }

    // ── Registered groups ──────────────────────────────────────────

    /// Insert or replace the group bound to `group.chat_id`
    pub async fn register_group(&self, group: RegisteredGroup) -> Result<()> {
        self.call(move |conn| {
            let config_json = group
                .container_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "INSERT OR REPLACE INTO registered_groups
                    (chat_id, name, folder, trigger, added_at, container_config)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &group.chat_id,
                    &group.name,
                    &group.folder,
                    &group.trigger,
                    format_timestamp(&group.added_at),
                    config_json,
                ],
            )?;
            debug!("Registered group {} ({})", group.folder, group.chat_id);
            Ok(())
        })
        .await
    }

    pub async fn get_group(&self, chat_id: &str) -> Result<Option<RegisteredGroup>> {
        let chat_id = chat_id.to_owned();
        self.call(move |conn| {
            let group = conn
                .query_row(
                    "SELECT chat_id, name, folder, trigger, added_at, container_config
                     FROM registered_groups WHERE chat_id = ?1",
                    params![&chat_id],
                    Self::row_to_group,
                )
                .optional()?;
            Ok(group)
        })
        .await
    }

    pub async fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        let folder = folder.to_owned();
        self.call(move |conn| {
            let group = conn
                .query_row(
                    "SELECT chat_id, name, folder, trigger, added_at, container_config
                     FROM registered_groups WHERE folder = ?1",
                    params![&folder],
                    Self::row_to_group,
                )
                .optional()?;
            Ok(group)
        })
        .await
    }

    pub async fn list_groups(&self) -> Result<Vec<RegisteredGroup>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, name, folder, trigger, added_at, container_config
                 FROM registered_groups ORDER BY added_at",
            )?;
            let groups = stmt
                .query_map([], Self::row_to_group)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(groups)
        })
        .await
    }

    fn row_to_group(row: &Row) -> rusqlite::Result<RegisteredGroup> {
        let config_str: Option<String> = row.get(5)?;
        let container_config = config_str
            .map(|s| serde_json::from_str::<ContainerConfig>(&s))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(RegisteredGroup {
            chat_id: row.get(0)?,
            name: row.get(1)?,
            folder: row.get(2)?,
            trigger: row.get(3)?,
            added_at: required_timestamp(row, 4)?,
            container_config,
        })
    }

    // ── Scheduled tasks ────────────────────────────────────────────

    pub async fn create_task(&self, task: ScheduledTask) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, group_folder, chat_id, prompt, schedule_type, schedule_value,
                     context_mode, next_run, last_run, last_result, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &task.id,
                    &task.group_folder,
                    &task.chat_id,
                    &task.prompt,
                    task.schedule_type.as_str(),
                    &task.schedule_value,
                    task.context_mode.as_str(),
                    task.next_run.as_ref().map(format_timestamp),
                    task.last_run.as_ref().map(format_timestamp),
                    &task.last_result,
                    task.status.as_str(),
                    format_timestamp(&task.created_at),
                ],
            )?;
            debug!("Created task {} for {}", task.id, task.group_folder);
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let id = id.to_owned();
        self.call(move |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                    params![&id],
                    Self::row_to_task,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at DESC"
            ))?;
            let tasks = stmt
                .query_map([], Self::row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    pub async fn list_tasks_for_group(&self, folder: &str) -> Result<Vec<ScheduledTask>> {
        let folder = folder.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE group_folder = ?1 ORDER BY created_at DESC"
            ))?;
            let tasks = stmt
                .query_map(params![&folder], Self::row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    /// Active tasks whose `next_run` is at or before `now`, earliest first
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let now = format_timestamp(&now);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run"
            ))?;
            let tasks = stmt
                .query_map(params![&now], Self::row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let id = id.to_owned();
        self.call(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), &id],
            )?;
            debug!("Updated task {} status to {}", id, status);
            Ok(())
        })
        .await
    }

    /// Record the outcome of a run; a `None` next run completes the task
    pub async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
        last_result: &str,
        ran_at: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_owned();
        let last_result = last_result.to_owned();
        let next_run = next_run.as_ref().map(format_timestamp);
        let ran_at = format_timestamp(&ran_at);

        self.call(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET next_run = ?1, last_run = ?2, last_result = ?3,
                     status = CASE WHEN ?1 IS NULL THEN 'completed' ELSE status END
                 WHERE id = ?4",
                params![next_run, &ran_at, &last_result, &id],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a task and its run history
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.call(move |conn| {
            conn.execute("DELETE FROM task_run_logs WHERE task_id = ?1", params![&id])?;
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![&id])?;
            debug!("Deleted task {}", id);
            Ok(())
        })
        .await
    }

    fn row_to_task(row: &Row) -> rusqlite::Result<ScheduledTask> {
        Ok(ScheduledTask {
            id: row.get(0)?,
            group_folder: row.get(1)?,
            chat_id: row.get(2)?,
            prompt: row.get(3)?,
            schedule_type: parsed_text(row, 4)?,
            schedule_value: row.get(5)?,
            context_mode: parsed_text(row, 6)?,
            next_run: optional_timestamp(row, 7)?,
            last_run: optional_timestamp(row, 8)?,
            last_result: row.get(9)?,
            status: parsed_text(row, 10)?,
            created_at: required_timestamp(row, 11)?,
        })
    }

    // ── Run logs ───────────────────────────────────────────────────

    pub async fn log_task_run(&self, log: TaskRunLog) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &log.task_id,
                    format_timestamp(&log.run_at),
                    log.duration_ms as i64,
                    log.status.as_str(),
                    &log.result,
                    &log.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Most recent run logs for a task, newest first
    pub async fn task_run_logs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        let task_id = task_id.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, run_at, duration_ms, status, result, error
                 FROM task_run_logs
                 WHERE task_id = ?1
                 ORDER BY run_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let logs = stmt
                .query_map(params![&task_id, limit as i64], |row| {
                    Ok(TaskRunLog {
                        task_id: row.get(0)?,
                        run_at: required_timestamp(row, 1)?,
                        duration_ms: row.get::<_, i64>(2)?.max(0) as u64,
                        status: parsed_text(row, 3)?,
                        result: row.get(4)?,
                        error: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(logs)
        })
        .await
    }

    // ── Sessions and router state ──────────────────────────────────

    pub async fn get_session(&self, group_folder: &str) -> Result<Option<String>> {
        let group_folder = group_folder.to_owned();
        self.call(move |conn| {
            let session = conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE group_folder = ?1",
                    params![&group_folder],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    pub async fn set_session(&self, group_folder: &str, session_id: &str) -> Result<()> {
        let group_folder = group_folder.to_owned();
        let session_id = session_id.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (group_folder, session_id) VALUES (?1, ?2)",
                params![&group_folder, &session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_owned();
        self.call(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM router_state WHERE key = ?1",
                    params![&key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO router_state (key, value) VALUES (?1, ?2)",
                params![&key, &value],
            )?;
            Ok(())
        })
        .await
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parsed_text<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn required_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{raw}'")))
}

fn optional_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{raw}'")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextMode, RunStatus, ScheduleType};
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("store").join("corral.db")).unwrap();
        (dir, store)
    }

    fn task(id: &str, folder: &str, next_run: Option<DateTime<Utc>>) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_id: format!("!{folder}:example.org"),
            prompt: "check the weather".to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_task_lifecycle() -> Result<()> {
        let (_dir, store) = open_store();
        let now = Utc::now();

        store.create_task(task("t1", "main", Some(now - Duration::seconds(5)))).await?;
        store.create_task(task("t2", "family", Some(now + Duration::hours(1)))).await?;

        let due = store.due_tasks(now).await?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "t1");

        store.update_task_status("t1", TaskStatus::Paused).await?;
        assert!(store.due_tasks(now).await?.is_empty());

        store.update_task_status("t1", TaskStatus::Active).await?;
        store
            .update_task_after_run("t1", None, "Completed", Utc::now())
            .await?;
        let done = store.get_task("t1").await?.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.next_run.is_none());
        assert!(done.last_run.is_some());
        assert_eq!(done.last_result.as_deref(), Some("Completed"));

        assert_eq!(store.list_tasks_for_group("family").await?.len(), 1);
        store.delete_task("t2").await?;
        assert!(store.get_task("t2").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_after_run_keeps_status_when_rescheduled() -> Result<()> {
        let (_dir, store) = open_store();
        let next = Utc::now() + Duration::minutes(5);
        store.create_task(task("t1", "main", Some(Utc::now()))).await?;
        store.update_task_after_run("t1", Some(next), "ok", Utc::now()).await?;

        let t = store.get_task("t1").await?.unwrap();
        assert_eq!(t.status, TaskStatus::Active);
        assert_eq!(format_timestamp(&t.next_run.unwrap()), format_timestamp(&next));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_logs_newest_first() -> Result<()> {
        let (_dir, store) = open_store();
        store.create_task(task("t1", "main", Some(Utc::now()))).await?;
        for (i, status) in [RunStatus::Success, RunStatus::Error].into_iter().enumerate() {
            store
                .log_task_run(TaskRunLog {
                    task_id: "t1".to_string(),
                    run_at: Utc::now() + Duration::seconds(i as i64),
                    duration_ms: 10,
                    status,
                    result: None,
                    error: None,
                })
                .await?;
        }
        let logs = store.task_run_logs("t1", 10).await?;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, RunStatus::Error);

        store.delete_task("t1").await?;
        assert!(store.task_run_logs("t1", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_groups_and_sessions() -> Result<()> {
        let (_dir, store) = open_store();
        let group = RegisteredGroup {
            chat_id: "!abc:example.org".to_string(),
            name: "Family".to_string(),
            folder: "family".to_string(),
            trigger: "@Andy".to_string(),
            added_at: Utc::now(),
            container_config: Some(ContainerConfig {
                timeout_ms: Some(1000),
                ..Default::default()
            }),
        };
        store.register_group(group.clone()).await?;

        let fetched = store.get_group("!abc:example.org").await?.unwrap();
        assert_eq!(fetched.folder, "family");
        assert_eq!(fetched.container_config.unwrap().timeout_ms, Some(1000));
        assert!(store.group_by_folder("family").await?.is_some());
        assert_eq!(store.list_groups().await?.len(), 1);

        assert!(store.get_session("family").await?.is_none());
        store.set_session("family", "sess-1").await?;
        assert_eq!(store.get_session("family").await?.as_deref(), Some("sess-1"));

        store.set_state("last_agent_timestamp:!abc", "2026-01-01T00:00:00.000Z").await?;
        assert!(store.get_state("last_agent_timestamp:!abc").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_chats_and_messages() -> Result<()> {
        let (_dir, store) = open_store();
        store.upsert_chat("!r:x", Some("Room"), "2026-01-01T00:00:01.000Z").await?;
        store.upsert_chat("!r:x", None, "2026-01-01T00:00:05.000Z").await?;

        let chats = store.list_chats().await?;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Room");
        assert_eq!(chats[0].last_message_time, "2026-01-01T00:00:05.000Z");

        for (id, ts) in [("m1", "2026-01-01T00:00:01.000Z"), ("m2", "2026-01-01T00:00:02.000Z")] {
            store
                .store_message(StoredMessage {
                    id: id.to_string(),
                    chat_id: "!r:x".to_string(),
                    sender: "@alice:x".to_string(),
                    sender_name: "Alice".to_string(),
                    content: format!("hello {id}"),
                    timestamp: ts.to_string(),
                    is_from_me: false,
                })
                .await?;
        }

        let since = store.messages_since("!r:x", "2026-01-01T00:00:01.000Z").await?;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "m2");

        let recent = store.recent_messages("!r:x", 10).await?;
        assert_eq!(recent.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m1", "m2"]);
        Ok(())
    }
}
