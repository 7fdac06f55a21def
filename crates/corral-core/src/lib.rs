//! corral-core - sandbox supervision for the corral host
//!
//! This crate provides:
//! - Configuration and path resolution
//! - The mount allowlist validator and per-run mount planner
//! - The container runner and its stdin/stdout wire contract
//! - The file-based IPC channel (writer, watcher, dispatcher)
//! - The orchestrator that drives sandbox runs from chat messages and schedules

pub mod channel;
pub mod config;
pub mod ipc;
pub mod locks;
pub mod orchestrator;
pub mod sandbox;
pub mod snapshot;

pub use channel::{ChatChannel, LogChannel};
pub use config::{CorralConfig, HostPaths};
pub use locks::TenantLocks;
pub use orchestrator::{HostContext, InboundMessage, Orchestrator};
