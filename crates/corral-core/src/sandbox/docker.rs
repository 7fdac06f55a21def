//! Container runner: one sandbox process per run
//!
//! Spawns `<binary> run -i --rm ...` with the planned mounts, writes the input
//! once over stdin, waits for exit under a timeout and decodes the result from
//! stdout. Every failure is returned as an error [`ContainerOutput`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use corral_store::RegisteredGroup;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::mounts::{MountPlan, MountPlanner};
use super::output::{ContainerInput, ContainerOutput, parse_output, tail};
use crate::config::CorralConfig;

/// Seam between callers and the sandbox runtime
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, group: &RegisteredGroup, input: &ContainerInput) -> ContainerOutput;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: String,
    pub image: String,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub start_marker: String,
    pub end_marker: String,
    pub verbose_logs: bool,
}

impl RunnerConfig {
    pub fn from_config(config: &CorralConfig) -> Self {
        Self {
            binary: config.container.binary.clone(),
            image: config.container.image.clone(),
            default_timeout: config.container_timeout(),
            max_output_bytes: config.container.max_output_bytes,
            start_marker: config.container.output_start_marker.clone(),
            end_marker: config.container.output_end_marker.clone(),
            verbose_logs: config.logging.verbose_container_logs,
        }
    }
}

pub struct ContainerRunner {
    config: RunnerConfig,
    planner: MountPlanner,
}

/// Captured stream, cut at the byte ceiling
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

enum Exit {
    Finished(Option<i32>),
    TimedOut,
}

impl ContainerRunner {
    pub fn new(config: RunnerConfig, planner: MountPlanner) -> Self {
        Self { config, planner }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn planner(&self) -> &MountPlanner {
        &self.planner
    }

    /// Check whether the container runtime answers `info`
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.binary)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Runtime arguments: mounts, credential names, image last
    pub fn build_args(&self, container_name: &str, plan: &MountPlan) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];

        // Values travel through the child's environment, never argv
        for (key, _) in &plan.env {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        for mount in &plan.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }

        args.push(self.config.image.clone());
        args
    }

    fn timeout_for(&self, group: &RegisteredGroup) -> Duration {
        group
            .container_config
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout)
    }

    async fn execute(&self, group: &RegisteredGroup, input: &ContainerInput) -> ContainerOutput {
        let started = Instant::now();
        let plan = match self.planner.plan(group, input.is_main).await {
            Ok(plan) => plan,
            Err(e) => {
                error!("Failed to prepare mounts for group {}: {:#}", group.name, e);
                return ContainerOutput::error(format!("Failed to prepare sandbox: {:#}", e));
            }
        };

        let payload = match serde_json::to_string(input) {
            Ok(json) => json,
            Err(e) => return ContainerOutput::error(format!("Failed to encode input: {}", e)),
        };

        let container_name = container_name(&group.folder);
        let args = self.build_args(&container_name, &plan);
        let timeout = self.timeout_for(group);

        info!(
            "Spawning sandbox for group {} ({} mount(s), main={}, scheduled={})",
            group.name,
            plan.mounts.len(),
            input.is_main,
            input.is_scheduled_task
        );

        let mut child = match Command::new(&self.config.binary)
            .args(&args)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {}: {}", self.config.binary, e);
                return ContainerOutput::error(format!(
                    "Failed to start container runtime '{}': {}",
                    self.config.binary, e
                ));
            }
        };

        let limit = self.config.max_output_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, limit)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, limit)));
        let stdin = child.stdin.take();

        // One deadline covers the stdin write, the exit and draining the pipes
        let deadline = tokio::time::Instant::now() + timeout;
        let waited = tokio::time::timeout_at(deadline, async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("Sandbox closed stdin early: {}", e);
                }
                let _ = stdin.shutdown().await;
            }
            child.wait().await
        })
        .await;

        let exit = match waited {
            Ok(Ok(status)) => Exit::Finished(status.code()),
            Ok(Err(e)) => {
                error!("Failed to wait for sandbox of group {}: {}", group.name, e);
                Exit::Finished(None)
            }
            Err(_) => {
                error!("Sandbox for group {} timed out, killing", group.name);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill sandbox process: {}", e);
                }
                let _ = child.wait().await;
                self.remove_container(&container_name).await;
                Exit::TimedOut
            }
        };

        let readers: Vec<_> = [&stdout_task, &stderr_task]
            .into_iter()
            .flatten()
            .map(|task| task.abort_handle())
            .collect();
        let (exit, stdout, stderr) = match exit {
            // Descendants may still hold the pipes after a kill
            Exit::TimedOut => {
                readers.iter().for_each(|r| r.abort());
                (Exit::TimedOut, Captured::default(), Captured::default())
            }
            Exit::Finished(code) => {
                let drained = tokio::time::timeout_at(deadline, async {
                    (join_capture(stdout_task).await, join_capture(stderr_task).await)
                })
                .await;
                match drained {
                    Ok((stdout, stderr)) => (Exit::Finished(code), stdout, stderr),
                    Err(_) => {
                        error!(
                            "Sandbox for group {} exited but its output stayed open past the timeout",
                            group.name
                        );
                        readers.iter().for_each(|r| r.abort());
                        self.remove_container(&container_name).await;
                        (Exit::TimedOut, Captured::default(), Captured::default())
                    }
                }
            }
        };

        let duration = started.elapsed();
        let stdout_text = stdout.text();
        let stderr_text = stderr.text();
        for line in stderr_text.lines().filter(|l| !l.is_empty()) {
            debug!("[sandbox:{}] {}", group.folder, line);
        }
        if stdout.truncated || stderr.truncated {
            warn!(
                "Sandbox output for group {} exceeded {} bytes and was truncated",
                group.name, limit
            );
        }

        let run_log = RunLog {
            group,
            input,
            payload: &payload,
            args: &args,
            plan: &plan,
            duration,
            exit: &exit,
            timeout,
            stdout: &stdout_text,
            stderr: &stderr_text,
        };
        match run_log.write(&self.planner.paths().groups_dir, self.config.verbose_logs, &self.config.binary).await {
            Ok(path) => debug!("Container log written to {}", path.display()),
            Err(e) => warn!("Failed to write container log for {}: {:#}", group.name, e),
        }

        match exit {
            Exit::TimedOut => ContainerOutput::error(format!(
                "Container timed out after {}ms",
                timeout.as_millis()
            )),
            Exit::Finished(code) if code != Some(0) => {
                let code = code.unwrap_or(-1);
                error!(
                    "Sandbox for group {} exited with code {} after {}ms",
                    group.name,
                    code,
                    duration.as_millis()
                );
                ContainerOutput::error(format!(
                    "Container exited with code {}: {}",
                    code,
                    tail(&stderr_text, 200)
                ))
            }
            Exit::Finished(_) => {
                let output = parse_output(&stdout_text, &self.config.start_marker, &self.config.end_marker);
                info!(
                    "Sandbox for group {} finished in {}ms (status {:?}, has_result {})",
                    group.name,
                    duration.as_millis(),
                    output.status,
                    output.result.is_some()
                );
                output
            }
        }
    }

    /// Best-effort removal of a container left behind by a killed client
    async fn remove_container(&self, name: &str) {
        let removal = Command::new(&self.config.binary)
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(10), removal).await {
            Ok(Ok(status)) if status.success() => debug!("Removed container {}", name),
            Ok(Ok(status)) => debug!("Removing container {} exited with {}", name, status),
            Ok(Err(e)) => debug!("Failed to remove container {}: {}", name, e),
            Err(_) => warn!("Timed out removing container {}", name),
        }
    }
}

#[async_trait]
impl AgentRunner for ContainerRunner {
    async fn run(&self, group: &RegisteredGroup, input: &ContainerInput) -> ContainerOutput {
        self.execute(group, input).await
    }
}

fn container_name(folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("corral-{}-{}", safe, Utc::now().timestamp_millis())
}

/// Read to EOF, keeping at most `limit` bytes and draining the rest
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(captured)
}

async fn join_capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Captured>>>,
) -> Captured {
    let Some(task) = task else {
        return Captured::default();
    };
    match task.await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Failed to read sandbox output: {}", e);
            Captured::default()
        }
        Err(e) => {
            warn!("Sandbox output reader failed: {}", e);
            Captured::default()
        }
    }
}

/// Human-readable record of one run, written under `groups/<folder>/logs/`
struct RunLog<'a> {
    group: &'a RegisteredGroup,
    input: &'a ContainerInput,
    payload: &'a str,
    args: &'a [String],
    plan: &'a MountPlan,
    duration: Duration,
    exit: &'a Exit,
    timeout: Duration,
    stdout: &'a str,
    stderr: &'a str,
}

impl RunLog<'_> {
    fn render(&self, verbose: bool, binary: &str) -> String {
        let now = Utc::now();
        let (exit_code, failed) = match self.exit {
            Exit::Finished(Some(code)) => (code.to_string(), *code != 0),
            Exit::Finished(None) => ("signal".to_string(), true),
            Exit::TimedOut => (format!("timeout after {}ms", self.timeout.as_millis()), true),
        };

        let mut lines = vec![
            "=== Container Run Log ===".to_string(),
            format!("Timestamp: {}", now.to_rfc3339()),
            format!("Group: {}", self.group.name),
            format!("IsMain: {}", self.input.is_main),
            format!("Scheduled: {}", self.input.is_scheduled_task),
            format!("Duration: {}ms", self.duration.as_millis()),
            format!("Exit Code: {}", exit_code),
            String::new(),
        ];

        if verbose {
            lines.push("=== Input ===".to_string());
            lines.push(self.payload.to_string());
            lines.push(String::new());
            lines.push("=== Runtime Args ===".to_string());
            lines.push(format!("{} {}", binary, self.args.join(" ")));
            lines.push(String::new());
            lines.push("=== Mounts ===".to_string());
            lines.extend(self.plan.mounts.iter().map(|m| m.to_string()));
            lines.push(String::new());
            lines.push("=== Stderr ===".to_string());
            lines.push(self.stderr.to_string());
            lines.push(String::new());
            lines.push("=== Stdout ===".to_string());
            lines.push(self.stdout.to_string());
        } else {
            lines.push("=== Input Summary ===".to_string());
            lines.push(format!("Prompt length: {} chars", self.input.prompt.chars().count()));
            lines.push(format!(
                "Session ID: {}",
                self.input.session_id.as_deref().unwrap_or("new")
            ));
            lines.push(String::new());
            lines.push("=== Mounts ===".to_string());
            lines.extend(self.plan.mounts.iter().map(|m| {
                if m.readonly {
                    format!("{} (ro)", m.container_path)
                } else {
                    m.container_path.clone()
                }
            }));
            lines.push(String::new());
            if failed {
                lines.push("=== Stderr (last 500 chars) ===".to_string());
                lines.push(tail(self.stderr, 500).to_string());
                lines.push(String::new());
            }
        }
        lines.join("\n")
    }

    async fn write(&self, groups_dir: &Path, verbose: bool, binary: &str) -> Result<PathBuf> {
        let logs_dir = groups_dir.join(&self.group.folder).join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", logs_dir))?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let path = logs_dir.join(format!("container-{}.log", stamp));
        tokio::fs::write(&path, self.render(verbose, binary))
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path)
    }
}
