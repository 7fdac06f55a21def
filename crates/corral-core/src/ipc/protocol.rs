//! IPC record types
//!
//! Records arrive as untrusted JSON tagged by `type`. They are decoded once at
//! the boundary into [`IpcRequest`]; nothing downstream sees raw JSON.

use serde::{Deserialize, Serialize};

/// The two per-tenant queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Fire-and-forget outbound chat messages
    Messages,
    /// Schedule and registry mutations
    Tasks,
}

impl Queue {
    pub const ALL: [Queue; 2] = [Queue::Messages, Queue::Tasks];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Queue::Messages => "messages",
            Queue::Tasks => "tasks",
        }
    }

    fn accepts(&self, kind: &str) -> bool {
        match self {
            Queue::Messages => kind == "message",
            Queue::Tasks => matches!(
                kind,
                "schedule_task"
                    | "pause_task"
                    | "resume_task"
                    | "cancel_task"
                    | "register_group"
                    | "refresh_groups"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
        #[serde(rename = "groupFolder", default, skip_serializing_if = "Option::is_none")]
        group_folder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_mode: Option<String>,
        #[serde(rename = "groupFolder", default, skip_serializing_if = "Option::is_none")]
        group_folder: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
    },
    RefreshGroups {},
}

impl IpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcRequest::Message { .. } => "message",
            IpcRequest::ScheduleTask { .. } => "schedule_task",
            IpcRequest::PauseTask { .. } => "pause_task",
            IpcRequest::ResumeTask { .. } => "resume_task",
            IpcRequest::CancelTask { .. } => "cancel_task",
            IpcRequest::RegisterGroup { .. } => "register_group",
            IpcRequest::RefreshGroups {} => "refresh_groups",
        }
    }

    pub fn queue(&self) -> Queue {
        match self {
            IpcRequest::Message { .. } => Queue::Messages,
            _ => Queue::Tasks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("record has no string 'type' field")]
    MissingType,

    #[error("malformed '{kind}' record: {reason}")]
    InvalidShape { kind: String, reason: String },
}

/// Result of decoding one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Request(IpcRequest),
    /// Well-formed JSON whose type does not belong in this queue
    Unknown(String),
}

pub fn parse_record(queue: Queue, bytes: &[u8]) -> Result<Parsed, IpcError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| IpcError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(IpcError::MissingType)?
        .to_string();

    if !queue.accepts(&kind) {
        return Ok(Parsed::Unknown(kind));
    }

    serde_json::from_value(value)
        .map(Parsed::Request)
        .map_err(|e| IpcError::InvalidShape {
            kind,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message() {
        let parsed = parse_record(
            Queue::Messages,
            br#"{"type":"message","chatJid":"!r:x","text":"hi","groupFolder":"main","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Parsed::Request(IpcRequest::Message {
                chat_jid: "!r:x".to_string(),
                text: "hi".to_string(),
                group_folder: Some("main".to_string()),
                timestamp: Some("2026-01-01T00:00:00Z".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_task_actions() {
        let parsed = parse_record(
            Queue::Tasks,
            br#"{"type":"schedule_task","prompt":"p","schedule_type":"cron","schedule_value":"0 9 * * *"}"#,
        )
        .unwrap();
        match parsed {
            Parsed::Request(IpcRequest::ScheduleTask {
                context_mode,
                group_folder,
                ..
            }) => {
                assert!(context_mode.is_none());
                assert!(group_folder.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            parse_record(Queue::Tasks, br#"{"type":"cancel_task","taskId":"t1"}"#).unwrap(),
            Parsed::Request(IpcRequest::CancelTask {
                task_id: "t1".to_string()
            })
        );
        assert_eq!(
            parse_record(Queue::Tasks, br#"{"type":"refresh_groups"}"#).unwrap(),
            Parsed::Request(IpcRequest::RefreshGroups {})
        );
    }

    #[test]
    fn test_unknown_type_in_queue() {
        assert_eq!(
            parse_record(Queue::Tasks, br#"{"type":"self_destruct"}"#).unwrap(),
            Parsed::Unknown("self_destruct".to_string())
        );
        // A message record is not a task action
        assert_eq!(
            parse_record(Queue::Tasks, br#"{"type":"message","chatJid":"a","text":"b"}"#).unwrap(),
            Parsed::Unknown("message".to_string())
        );
    }

    #[test]
    fn test_malformed_records() {
        assert!(matches!(
            parse_record(Queue::Tasks, b"{not json"),
            Err(IpcError::InvalidJson(_))
        ));
        assert_eq!(
            parse_record(Queue::Tasks, br#"{"taskId":"t"}"#),
            Err(IpcError::MissingType)
        );
        assert!(matches!(
            parse_record(Queue::Tasks, br#"{"type":"register_group","jid":"x"}"#),
            Err(IpcError::InvalidShape { ref kind, .. }) if kind == "register_group"
        ));
    }

    #[test]
    fn test_kind_and_queue() {
        let req = IpcRequest::PauseTask {
            task_id: "t".to_string(),
        };
        assert_eq!(req.kind(), "pause_task");
        assert_eq!(req.queue(), Queue::Tasks);
        assert_eq!(Queue::Messages.dir_name(), "messages");
    }
}
