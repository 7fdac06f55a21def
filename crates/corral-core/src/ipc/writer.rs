//! Writer side of the IPC queues
//!
//! A record is written to a temporary file in the target directory and then
//! renamed into place, so a polling reader only ever sees complete files.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::protocol::IpcRequest;

/// Write `contents` to `path` through a sibling temporary file and a rename
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{:?} has no parent directory", path))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {:?}", parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(
        ".{}.{}.tmp",
        file_name,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));

    tokio::fs::write(&temp, contents)
        .await
        .with_context(|| format!("Failed to write {:?}", temp))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("Failed to move {:?} into place", path));
    }
    Ok(())
}

/// Pretty-printed JSON written atomically
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    write_atomic(path, &json).await
}

/// Enqueues requests into one tenant's IPC directory
#[derive(Debug, Clone)]
pub struct IpcWriter {
    tenant_dir: PathBuf,
}

impl IpcWriter {
    /// `tenant_dir` is the directory holding `messages/` and `tasks/`
    /// (`/workspace/ipc` inside a sandbox)
    pub fn new(tenant_dir: impl Into<PathBuf>) -> Self {
        Self {
            tenant_dir: tenant_dir.into(),
        }
    }

    /// Time-prefixed so a lexical sort follows creation order
    fn file_name() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}.json", Utc::now().timestamp_millis(), &suffix[..6])
    }

    /// Write a request into the queue its type belongs to
    pub async fn send(&self, request: &IpcRequest) -> Result<PathBuf> {
        let dir = self.tenant_dir.join(request.queue().dir_name());
        let path = dir.join(Self::file_name());
        write_json_atomic(&path, request).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_send_routes_by_queue() -> Result<()> {
        let tmp = TempDir::new()?;
        let writer = IpcWriter::new(tmp.path());

        let msg = writer
            .send(&IpcRequest::Message {
                chat_jid: "!r:x".to_string(),
                text: "hello".to_string(),
                group_folder: Some("main".to_string()),
                timestamp: None,
            })
            .await?;
        let task = writer
            .send(&IpcRequest::PauseTask {
                task_id: "task-1".to_string(),
            })
            .await?;

        assert!(msg.starts_with(tmp.path().join("messages")));
        assert!(task.starts_with(tmp.path().join("tasks")));

        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&task)?)?;
        assert_eq!(value["type"], "pause_task");
        assert_eq!(value["taskId"], "task-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_names_sort_by_time() -> Result<()> {
        let tmp = TempDir::new()?;
        let writer = IpcWriter::new(tmp.path());
        let first = writer.send(&IpcRequest::RefreshGroups {}).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = writer.send(&IpcRequest::RefreshGroups {}).await?;
        assert!(first.file_name() < second.file_name());
        assert!(first.extension().is_some_and(|e| e == "json"));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("snapshot.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).await?;
        write_json_atomic(&path, &serde_json::json!({"a": 2})).await?;

        let names: Vec<_> = std::fs::read_dir(tmp.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(value["a"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_reader_never_sees_partial_json() -> Result<()> {
        let tmp = TempDir::new()?;
        let queue = tmp.path().join("tasks");
        std::fs::create_dir_all(&queue)?;
        let writer = IpcWriter::new(tmp.path());

        let reader_dir = queue.clone();
        let reader = tokio::spawn(async move {
            let mut seen = 0usize;
            for _ in 0..200 {
                if let Ok(entries) = std::fs::read_dir(&reader_dir) {
                    for entry in entries.filter_map(|e| e.ok()) {
                        let path = entry.path();
                        if path.extension().is_some_and(|e| e == "json") {
                            let bytes = std::fs::read(&path).unwrap();
                            serde_json::from_slice::<serde_json::Value>(&bytes)
                                .expect("complete JSON");
                            seen += 1;
                        }
                    }
                }
                tokio::task::yield_now().await;
            }
            seen
        });

        let big_prompt = "x".repeat(256 * 1024);
        for _ in 0..20 {
            writer
                .send(&IpcRequest::ScheduleTask {
                    prompt: big_prompt.clone(),
                    schedule_type: "interval".to_string(),
                    schedule_value: "60000".to_string(),
                    context_mode: None,
                    group_folder: None,
                })
                .await?;
        }
        reader.await?;
        Ok(())
    }
}
