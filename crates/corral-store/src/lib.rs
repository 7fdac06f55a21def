//! corral-store - durable state for the corral supervisor
//!
//! This crate provides:
//! - Record types shared by the scheduler, the IPC dispatcher and the live path
//! - A SQLite-backed `Store` for chats, messages, groups, tasks, run logs,
//!   sessions and router state

pub mod models;
pub mod sqlite;

pub use models::{
    AdditionalMount, ChatInfo, ContainerConfig, ContextMode, RegisteredGroup, RunStatus,
    ScheduleType, ScheduledTask, StoredMessage, TaskRunLog, TaskStatus, format_timestamp,
    parse_timestamp,
};
pub use sqlite::Store;
