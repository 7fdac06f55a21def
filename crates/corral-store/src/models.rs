//! Records persisted by the store

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Render a timestamp in the fixed-width form used for every stored column.
///
/// All timestamps are UTC with millisecond precision, so lexical order in SQL
/// equals chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn default_true() -> bool {
    true
}

/// A tenant's request to expose an extra host path inside its sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalMount {
    /// Host path, `~` is expanded
    pub host_path: String,
    /// Relative name nested under `/workspace/extra/` in the sandbox
    pub container_path: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

/// Per-group sandbox overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    /// Run timeout in milliseconds; the global default applies when unset
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A registered routing target (tenant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Chat room the tenant is bound to
    pub chat_id: String,
    pub name: String,
    /// Filesystem namespace under `groups/`, `data/ipc/` and `data/sessions/`
    pub folder: String,
    pub trigger: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
}

/// Chat metadata as seen by the chat client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_id: String,
    pub name: String,
    pub last_message_time: String,
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

/// How `schedule_value` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

text_enum!(ScheduleType {
    Cron => "cron",
    Interval => "interval",
    Once => "once",
});

/// Whether a scheduled run shares the tenant's conversation session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

text_enum!(ContextMode {
    Group => "group",
    Isolated => "isolated",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
    Completed,
}

text_enum!(TaskStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

text_enum!(RunStatus {
    Success => "success",
    Error => "error",
});

/// A unit of scheduled work.
///
/// `next_run` is `None` exactly when the task is completed (or a one-shot that
/// already ran).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// One execution attempt of a scheduled task (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}
