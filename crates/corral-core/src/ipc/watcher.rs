//! Host side of the IPC queues
//!
//! Polls `ipc/<folder>/{messages,tasks}/*.json`, decodes each file and hands
//! the request to the dispatcher over a channel. The file is deleted once the
//! dispatcher acknowledges it, or moved to `ipc/errors/<folder>-<name>` when
//! decoding or handling fails.

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{IpcRequest, Parsed, Queue, parse_record};

pub const ERRORS_DIR: &str = "errors";

/// One decoded request awaiting dispatch
#[derive(Debug)]
pub struct IpcEnvelope {
    /// Tenant folder whose directory the file was found in
    pub source_folder: String,
    pub request: IpcRequest,
    pub reply: oneshot::Sender<Result<()>>,
}

pub struct IpcWatcher {
    ipc_dir: PathBuf,
    poll_interval: Duration,
    tx: mpsc::Sender<IpcEnvelope>,
}

impl IpcWatcher {
    pub fn new(ipc_dir: PathBuf, poll_interval: Duration, tx: mpsc::Sender<IpcEnvelope>) -> Self {
        Self {
            ipc_dir,
            poll_interval,
            tx,
        }
    }

    /// Poll until `cancel` fires or the dispatcher goes away
    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.ipc_dir).await {
            error!("Failed to create IPC directory {:?}: {}", self.ipc_dir, e);
        }
        info!("IPC watcher started on {}", self.ipc_dir.display());

        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => debug!("Processed {} IPC file(s)", n),
                Err(e) => {
                    error!("IPC watcher stopping: {:#}", e);
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("IPC watcher stopped");
    }

    /// Process every pending file once. Errors only when the dispatcher is gone.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut processed = 0;
        for folder in self.tenant_folders().await {
            for queue in Queue::ALL {
                let dir = self.ipc_dir.join(&folder).join(queue.dir_name());
                for file in pending_files(&dir).await {
                    self.process_file(&folder, queue, &file).await?;
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    async fn tenant_folders(&self) -> Vec<String> {
        let mut folders = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.ipc_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {:?}: {}", self.ipc_dir, e);
                return folders;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && name != ERRORS_DIR {
                folders.push(name);
            }
        }
        folders.sort();
        folders
    }

    async fn process_file(&self, folder: &str, queue: Queue, path: &Path) -> Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read IPC file {:?}: {}", path, e);
                self.quarantine(folder, path).await;
                return Ok(());
            }
        };

        let request = match parse_record(queue, &bytes) {
            Ok(Parsed::Request(request)) => request,
            Ok(Parsed::Unknown(kind)) => {
                warn!(
                    "Unknown IPC {} type '{}' from {}, dropping",
                    queue.dir_name(),
                    kind,
                    folder
                );
                remove(path).await;
                return Ok(());
            }
            Err(e) => {
                error!("Malformed IPC file {:?} from {}: {}", path, folder, e);
                self.quarantine(folder, path).await;
                return Ok(());
            }
        };

        let kind = request.kind();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcEnvelope {
                source_folder: folder.to_string(),
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("IPC dispatcher is gone"))?;

        match reply_rx.await {
            Ok(Ok(())) => {
                debug!("IPC {} from {} handled", kind, folder);
                remove(path).await;
            }
            Ok(Err(e)) => {
                error!("Error processing IPC {} from {}: {:#}", kind, folder, e);
                self.quarantine(folder, path).await;
            }
            Err(_) => {
                return Err(anyhow!("IPC dispatcher dropped a request without replying"));
            }
        }
        Ok(())
    }

    /// Move a failed file to the shared errors directory, prefixed by tenant
    async fn quarantine(&self, folder: &str, path: &Path) {
        let errors_dir = self.ipc_dir.join(ERRORS_DIR);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = errors_dir.join(format!("{}-{}", folder, file_name));

        let moved = async {
            tokio::fs::create_dir_all(&errors_dir)
                .await
                .with_context(|| format!("Failed to create {:?}", errors_dir))?;
            tokio::fs::rename(path, &target)
                .await
                .with_context(|| format!("Failed to move {:?} to {:?}", path, target))
        }
        .await;

        if let Err(e) = moved {
            error!("{:#}", e);
            // Never leave the file to be retried forever
            remove(path).await;
        }
    }
}

/// `*.json` files in `dir`, sorted by name
async fn pending_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    files
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to delete IPC file {:?}: {}", path, e);
    }
}
