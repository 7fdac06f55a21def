//! corral - run chat-driven agent work in short-lived sandbox containers
//!
//! Usage:
//!   corral run                      start the supervisor
//!   corral chat <chat_id>           feed stdin lines to the live-message path
//!   corral allowlist template       print a mount allowlist template
//!   corral allowlist check <host> <name> [--rw] [--main]
//!   corral tasks list | corral tasks logs <id>
//!   corral group register <chat_id> <name> <folder> [--trigger @Name]

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use corral_core::ipc::{IpcDispatcher, IpcWatcher};
use corral_core::orchestrator::validate_folder;
use corral_core::sandbox::{
    ContainerRunner, MountPlanner, MountValidator, RunnerConfig, allowlist_template,
};
use corral_core::{CorralConfig, HostContext, HostPaths, InboundMessage, LogChannel, Orchestrator};
use corral_scheduler::{Scheduler, SchedulerConfig};
use corral_store::{AdditionalMount, RegisteredGroup, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "corral", version, about = "Single-host supervisor for sandboxed agent runs")]
struct Cli {
    /// Config file (defaults to ~/.config/corral/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and IPC loops and run until Ctrl-C
    Run,

    /// Read messages from stdin and handle them as if sent to a chat
    Chat {
        chat_id: String,
        /// Display name recorded for the chat
        #[arg(long)]
        name: Option<String>,
        /// Sender name recorded for each message
        #[arg(long, default_value = "user")]
        sender: String,
    },

    /// Inspect the mount allowlist
    Allowlist {
        #[command(subcommand)]
        command: AllowlistCommand,
    },

    /// Inspect scheduled tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Manage registered groups
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
}

#[derive(Subcommand)]
enum AllowlistCommand {
    /// Print an example allowlist
    Template,
    /// Validate one mount request against the configured allowlist
    Check {
        host_path: String,
        container_path: String,
        /// Request read-write access
        #[arg(long)]
        rw: bool,
        /// Validate as the privileged tenant
        #[arg(long)]
        main: bool,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List all scheduled tasks
    List,
    /// Show recent runs of a task
    Logs {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Bind a chat to a group folder
    Register {
        chat_id: String,
        name: String,
        folder: String,
        /// Trigger word (defaults to @<assistant_name>)
        #[arg(long)]
        trigger: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(CorralConfig::default_path);
    let mut config = CorralConfig::load(&config_path)?;
    config.apply_env();
    let paths = config.resolve_paths()?;

    match cli.command {
        Commands::Run => cmd_run(config, paths).await,
        Commands::Chat {
            chat_id,
            name,
            sender,
        } => cmd_chat(config, paths, chat_id, name, sender).await,
        Commands::Allowlist { command } => match command {
            AllowlistCommand::Template => cmd_allowlist_template(),
            AllowlistCommand::Check {
                host_path,
                container_path,
                rw,
                main,
            } => cmd_allowlist_check(&paths, host_path, container_path, rw, main),
        },
        Commands::Tasks { command } => match command {
            TasksCommand::List => cmd_tasks_list(&paths).await,
            TasksCommand::Logs { id, limit } => cmd_tasks_logs(&paths, &id, limit).await,
        },
        Commands::Group { command } => match command {
            GroupCommand::Register {
                chat_id,
                name,
                folder,
                trigger,
            } => cmd_group_register(config, paths, chat_id, name, folder, trigger).await,
        },
    }
}

fn open_store(paths: &HostPaths) -> Result<Store> {
    Store::open(&paths.store_path)
        .with_context(|| format!("Failed to open store at {}", paths.store_path.display()))
}

fn build_runner(config: &CorralConfig, paths: &HostPaths) -> ContainerRunner {
    let validator = MountValidator::load_for_host(paths);
    let planner = MountPlanner::new(
        paths.clone(),
        validator,
        config.container.credential_keys.clone(),
    );
    ContainerRunner::new(RunnerConfig::from_config(config), planner)
}

fn build_context(config: CorralConfig, paths: HostPaths, runner: ContainerRunner) -> Result<Arc<HostContext>> {
    let store = open_store(&paths)?;
    let ctx = HostContext::new(config, paths, store, Arc::new(runner), Arc::new(LogChannel))?;
    Ok(Arc::new(ctx))
}

/// Background loops sharing one cancellation token
struct Supervisor {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Fatal only when the container runtime or the store is unusable
    async fn start(config: CorralConfig, paths: HostPaths) -> Result<Self> {
        let runner = build_runner(&config, &paths);
        if !runner.is_available().await {
            bail!(
                "Container runtime '{}' is not available (is it installed and running?)",
                config.container.binary
            );
        }
        info!("Container runtime '{}' is available", config.container.binary);

        let scheduler_poll = config.scheduler_poll_interval();
        let ipc_poll = config.ipc_poll_interval();
        let ctx = build_context(config, paths, runner)?;
        let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let scheduler = Scheduler::new(
            ctx.store.clone(),
            orchestrator.clone(),
            SchedulerConfig {
                poll_interval: scheduler_poll,
                timezone: ctx.timezone,
            },
        );
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { scheduler.run(token).await }));

        let (tx, rx) = mpsc::channel(64);
        let dispatcher = IpcDispatcher::new(ctx.clone());
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { dispatcher.run(rx, token).await }));

        let watcher = IpcWatcher::new(ctx.paths.ipc_dir(), ipc_poll, tx);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { watcher.run(token).await }));

        info!(
            "corral v{} started (assistant {}, main folder {})",
            env!("CARGO_PKG_VERSION"),
            ctx.config.assistant_name,
            ctx.config.main_group_folder
        );

        Ok(Self {
            orchestrator,
            cancel,
            handles,
        })
    }

    async fn shutdown(self) {
        info!("Shutting down...");
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
    }
}

async fn cmd_run(config: CorralConfig, paths: HostPaths) -> Result<()> {
    let supervisor = Supervisor::start(config, paths).await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    supervisor.shutdown().await;
    Ok(())
}

async fn cmd_chat(
    config: CorralConfig,
    paths: HostPaths,
    chat_id: String,
    name: Option<String>,
    sender: String,
) -> Result<()> {
    let supervisor = Supervisor::start(config, paths).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let message = InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.clone(),
            chat_name: name.clone(),
            sender: sender.clone(),
            sender_name: sender.clone(),
            content: line,
            timestamp: Utc::now(),
        };
        match supervisor.orchestrator.handle_message(message).await {
            Ok(Some(reply)) => println!("{}", reply),
            Ok(None) => {}
            Err(e) => error!("Failed to handle message: {:#}", e),
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

fn cmd_allowlist_template() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&allowlist_template())?);
    Ok(())
}

fn cmd_allowlist_check(
    paths: &HostPaths,
    host_path: String,
    container_path: String,
    rw: bool,
    main: bool,
) -> Result<()> {
    let validator = MountValidator::load_for_host(paths);
    let request = AdditionalMount {
        host_path,
        container_path,
        readonly: !rw,
    };
    match validator.validate(&request, main) {
        Ok(mount) => {
            println!("ALLOWED: {}", mount.reason);
            println!(
                "  {} -> {}{}",
                mount.host_path.display(),
                mount.container_path,
                if mount.readonly { " (ro)" } else { "" }
            );
            Ok(())
        }
        Err(rejection) => bail!("DENIED: {}", rejection),
    }
}

async fn cmd_tasks_list(paths: &HostPaths) -> Result<()> {
    let store = open_store(paths)?;
    let tasks = store.list_tasks().await?;
    if tasks.is_empty() {
        println!("No scheduled tasks.");
        return Ok(());
    }
    for task in tasks {
        let next = task
            .next_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  [{}]  {}  {} {}  next: {}",
            task.id, task.status, task.group_folder, task.schedule_type, task.schedule_value, next
        );
        let prompt: String = task.prompt.chars().take(80).collect();
        println!("    {}", prompt);
        if let Some(last) = task.last_result {
            println!("    last: {}", last);
        }
    }
    Ok(())
}

async fn cmd_tasks_logs(paths: &HostPaths, id: &str, limit: usize) -> Result<()> {
    let store = open_store(paths)?;
    if store.get_task(id).await?.is_none() {
        warn!("Task {} not found, showing any remaining logs", id);
    }
    let logs = store.task_run_logs(id, limit).await?;
    if logs.is_empty() {
        println!("No runs recorded for {}.", id);
        return Ok(());
    }
    for log in logs {
        let detail = log.error.or(log.result).unwrap_or_default();
        let detail: String = detail.chars().take(120).collect();
        println!(
            "{}  {}  {}ms  {}",
            log.run_at.to_rfc3339(),
            log.status,
            log.duration_ms,
            detail
        );
    }
    Ok(())
}

async fn cmd_group_register(
    config: CorralConfig,
    paths: HostPaths,
    chat_id: String,
    name: String,
    folder: String,
    trigger: Option<String>,
) -> Result<()> {
    validate_folder(&folder)?;
    let runner = build_runner(&config, &paths);
    let ctx = build_context(config, paths, runner)?;
    let trigger = trigger.unwrap_or_else(|| ctx.default_trigger());
    ctx.register_group(RegisteredGroup {
        chat_id: chat_id.clone(),
        name,
        folder: folder.clone(),
        trigger,
        added_at: Utc::now(),
        container_config: None,
    })
    .await?;
    println!("Registered {} as group folder '{}'", chat_id, folder);
    Ok(())
}
