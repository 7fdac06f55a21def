//! File-based IPC between sandboxes and the host
//!
//! Each tenant owns `ipc/<folder>/messages/` and `ipc/<folder>/tasks/`.
//! Sandboxes write records with [`IpcWriter`]; the host polls them with
//! [`IpcWatcher`] and applies them through [`IpcDispatcher`].

pub mod dispatch;
pub mod protocol;
pub mod watcher;
pub mod writer;

pub use dispatch::IpcDispatcher;
pub use protocol::{IpcError, IpcRequest, Parsed, Queue, parse_record};
pub use watcher::{ERRORS_DIR, IpcEnvelope, IpcWatcher};
pub use writer::{IpcWriter, write_atomic, write_json_atomic};
