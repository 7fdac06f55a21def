//! Read-only views written into a tenant's IPC directory before each run

use anyhow::Result;
use chrono::Utc;
use corral_store::{ChatInfo, RegisteredGroup, ScheduledTask, format_timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::ipc::write_json_atomic;

pub const TASKS_SNAPSHOT: &str = "current_tasks.json";
pub const GROUPS_SNAPSHOT: &str = "available_groups.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(rename = "groupFolder")]
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: Option<String>,
}

impl From<&ScheduledTask> for TaskSnapshot {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            id: task.id.clone(),
            group_folder: task.group_folder.clone(),
            prompt: task.prompt.clone(),
            schedule_type: task.schedule_type.to_string(),
            schedule_value: task.schedule_value.clone(),
            status: task.status.to_string(),
            next_run: task.next_run.as_ref().map(format_timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableGroup {
    pub jid: String,
    pub name: String,
    #[serde(rename = "lastActivity")]
    pub last_activity: String,
    #[serde(rename = "isRegistered")]
    pub is_registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsSnapshot {
    pub groups: Vec<AvailableGroup>,
    #[serde(rename = "lastSync")]
    pub last_sync: String,
}

/// Chats known to the store, flagged by whether a tenant is bound to them
pub fn available_groups(chats: &[ChatInfo], registered: &[RegisteredGroup]) -> Vec<AvailableGroup> {
    let bound: HashSet<&str> = registered.iter().map(|g| g.chat_id.as_str()).collect();
    chats
        .iter()
        .map(|chat| AvailableGroup {
            jid: chat.chat_id.clone(),
            name: chat.name.clone(),
            last_activity: chat.last_message_time.clone(),
            is_registered: bound.contains(chat.chat_id.as_str()),
        })
        .collect()
}

/// All tasks for the privileged tenant, only its own otherwise
pub async fn write_tasks_snapshot(
    ipc_dir: &Path,
    folder: &str,
    is_privileged: bool,
    tasks: &[ScheduledTask],
) -> Result<()> {
    let visible: Vec<TaskSnapshot> = tasks
        .iter()
        .filter(|t| is_privileged || t.group_folder == folder)
        .map(TaskSnapshot::from)
        .collect();
    write_json_atomic(&ipc_dir.join(folder).join(TASKS_SNAPSHOT), &visible).await
}

/// Non-privileged tenants always get an empty list
pub async fn write_groups_snapshot(
    ipc_dir: &Path,
    folder: &str,
    is_privileged: bool,
    groups: Vec<AvailableGroup>,
) -> Result<()> {
    let snapshot = GroupsSnapshot {
        groups: if is_privileged { groups } else { Vec::new() },
        last_sync: format_timestamp(&Utc::now()),
    };
    write_json_atomic(&ipc_dir.join(folder).join(GROUPS_SNAPSHOT), &snapshot).await
}
