//! Host context and the two drivers of the sandbox runner
//!
//! [`HostContext`] is built once at startup and shared by the live-message
//! path, the scheduler executor and the IPC dispatcher. [`Orchestrator`] turns
//! inbound chat messages and due tasks into sandbox runs.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use corral_scheduler::{TaskExecutor, TaskOutcome, parse_timezone};
use corral_store::{
    ContextMode, RegisteredGroup, ScheduledTask, Store, StoredMessage, format_timestamp,
};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::channel::ChatChannel;
use crate::config::{CorralConfig, HostPaths};
use crate::locks::TenantLocks;
use crate::sandbox::{AgentRunner, ContainerInput, ContainerOutput};
use crate::snapshot::{available_groups, write_groups_snapshot, write_tasks_snapshot};

/// Messages pulled in as conversation context for a live run
const RECENT_CONTEXT: usize = 50;

/// Shared handles for every component of the supervisor
pub struct HostContext {
    pub config: CorralConfig,
    pub paths: HostPaths,
    pub store: Store,
    pub runner: Arc<dyn AgentRunner>,
    pub channel: Arc<dyn ChatChannel>,
    pub locks: TenantLocks,
    pub timezone: Tz,
    trigger: Regex,
}

impl HostContext {
    pub fn new(
        config: CorralConfig,
        paths: HostPaths,
        store: Store,
        runner: Arc<dyn AgentRunner>,
        channel: Arc<dyn ChatChannel>,
    ) -> Result<Self> {
        let timezone = parse_timezone(&config.scheduler.timezone)
            .with_context(|| format!("Invalid scheduler timezone '{}'", config.scheduler.timezone))?;
        let trigger = trigger_pattern(&config.assistant_name)?;
        Ok(Self {
            config,
            paths,
            store,
            runner,
            channel,
            locks: TenantLocks::new(),
            timezone,
            trigger,
        })
    }

    pub fn is_privileged(&self, folder: &str) -> bool {
        folder == self.config.main_group_folder
    }

    /// Whether `text` starts with `@<assistant_name>`
    pub fn trigger_matches(&self, text: &str) -> bool {
        self.trigger.is_match(text.trim_start())
    }

    pub fn default_trigger(&self) -> String {
        format!("@{}", self.config.assistant_name)
    }

    /// Persist a tenant and create its folder
    pub async fn register_group(&self, group: RegisteredGroup) -> Result<()> {
        validate_folder(&group.folder)?;
        if let Some(existing) = self.store.group_by_folder(&group.folder).await?
            && existing.chat_id != group.chat_id
        {
            bail!(
                "Folder '{}' is already bound to chat {}",
                group.folder,
                existing.chat_id
            );
        }

        let logs_dir = self.paths.groups_dir.join(&group.folder).join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", logs_dir))?;

        info!(
            "Group registered: chat={}, name={}, folder={}",
            group.chat_id, group.name, group.folder
        );
        self.store.register_group(group).await
    }

    /// Send text to a chat and keep it as conversation context
    pub async fn send_message(&self, chat_id: &str, text: &str, message_id: String) -> Result<()> {
        self.channel
            .send_message(chat_id, text)
            .await
            .with_context(|| format!("Failed to send message to {}", chat_id))?;
        info!("Message sent to {} ({} chars)", chat_id, text.chars().count());

        self.store
            .store_message(StoredMessage {
                id: message_id,
                chat_id: chat_id.to_string(),
                sender: "bot".to_string(),
                sender_name: self.config.assistant_name.clone(),
                content: text.to_string(),
                timestamp: format_timestamp(&Utc::now()),
                is_from_me: true,
            })
            .await
    }

    pub async fn write_tasks_snapshot(&self, folder: &str) -> Result<()> {
        let tasks = self.store.list_tasks().await?;
        write_tasks_snapshot(&self.paths.ipc_dir(), folder, self.is_privileged(folder), &tasks).await
    }

    pub async fn write_groups_snapshot(&self, folder: &str) -> Result<()> {
        let chats = self.store.list_chats().await?;
        let groups = self.store.list_groups().await?;
        write_groups_snapshot(
            &self.paths.ipc_dir(),
            folder,
            self.is_privileged(folder),
            available_groups(&chats, &groups),
        )
        .await
    }
}

/// Case-insensitive `@name` at the start of a message, followed by a word boundary
pub fn trigger_pattern(assistant_name: &str) -> Result<Regex> {
    Regex::new(&format!(r"(?i)^@{}\b", regex::escape(assistant_name)))
        .context("Failed to build trigger pattern")
}

/// Folder names become path segments under groups/, ipc/ and sessions/
pub fn validate_folder(folder: &str) -> Result<()> {
    if folder.is_empty() {
        bail!("Group folder must not be empty");
    }
    if folder == "." || folder == ".." || folder.contains('/') || folder.contains('\\') {
        bail!("Invalid group folder '{}'", folder);
    }
    if folder == crate::ipc::ERRORS_DIR || folder == crate::sandbox::mounts::GLOBAL_FOLDER {
        bail!("Group folder '{}' is reserved", folder);
    }
    if !folder
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!("Group folder '{}' may only contain letters, digits, '-', '_' and '.'", folder);
    }
    Ok(())
}

/// Folder for a chat seen for the first time
pub fn folder_for_chat(chat_id: &str) -> String {
    let safe: String = chat_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("chat-{}", safe)
}

/// An inbound chat message handed over by the chat client
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub chat_name: Option<String>,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the conversation as the `<messages>` prompt the agent expects
pub fn build_prompt(messages: &[StoredMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                m.timestamp,
                escape_xml(&m.content)
            )
        })
        .collect();
    format!("<messages>\n{}\n</messages>", lines.join("\n"))
}

fn last_agent_key(chat_id: &str) -> String {
    format!("last_agent_timestamp:{}", chat_id)
}

pub struct Orchestrator {
    ctx: Arc<HostContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    /// One exclusive sandbox run for `group`
    pub async fn run_agent(
        &self,
        group: &RegisteredGroup,
        prompt: String,
        chat_id: &str,
        session_id: Option<String>,
        is_scheduled_task: bool,
        persist_session: bool,
    ) -> ContainerOutput {
        let is_main = self.ctx.is_privileged(&group.folder);
        let _guard = self.ctx.locks.acquire(&group.folder).await;

        if let Err(e) = self.ctx.write_tasks_snapshot(&group.folder).await {
            warn!("Failed to write tasks snapshot for {}: {:#}", group.folder, e);
        }
        if let Err(e) = self.ctx.write_groups_snapshot(&group.folder).await {
            warn!("Failed to write groups snapshot for {}: {:#}", group.folder, e);
        }

        let input = ContainerInput {
            prompt,
            session_id,
            group_folder: group.folder.clone(),
            chat_jid: chat_id.to_string(),
            is_main,
            is_scheduled_task,
            images: Vec::new(),
        };
        let output = self.ctx.runner.run(group, &input).await;

        if persist_session
            && let Some(session) = &output.new_session_id
            && let Err(e) = self.ctx.store.set_session(&group.folder, session).await
        {
            warn!("Failed to persist session for {}: {:#}", group.folder, e);
        }
        output
    }

    async fn group_for_chat(&self, msg: &InboundMessage) -> Result<RegisteredGroup> {
        if let Some(group) = self.ctx.store.get_group(&msg.chat_id).await? {
            return Ok(group);
        }

        let main_folder = &self.ctx.config.main_group_folder;
        let is_main_chat = self.ctx.config.main_chat_id.as_deref() == Some(msg.chat_id.as_str());
        let folder = if is_main_chat && self.ctx.store.group_by_folder(main_folder).await?.is_none() {
            main_folder.clone()
        } else {
            folder_for_chat(&msg.chat_id)
        };

        let group = RegisteredGroup {
            chat_id: msg.chat_id.clone(),
            name: msg.chat_name.clone().unwrap_or_else(|| folder.clone()),
            folder,
            trigger: self.ctx.default_trigger(),
            added_at: Utc::now(),
            container_config: None,
        };
        self.ctx.register_group(group.clone()).await?;
        Ok(group)
    }

    /// Handle one inbound message; returns the reply that was sent, if any
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<Option<String>> {
        let store = &self.ctx.store;
        let timestamp = format_timestamp(&msg.timestamp);

        store
            .upsert_chat(&msg.chat_id, msg.chat_name.as_deref(), &timestamp)
            .await?;
        store
            .store_message(StoredMessage {
                id: msg.id.clone(),
                chat_id: msg.chat_id.clone(),
                sender: msg.sender.clone(),
                sender_name: msg.sender_name.clone(),
                content: msg.content.clone(),
                timestamp: timestamp.clone(),
                is_from_me: false,
            })
            .await?;

        let group = self.group_for_chat(&msg).await?;
        if !self.ctx.is_privileged(&group.folder) && !self.ctx.trigger_matches(&msg.content) {
            debug!("No trigger in message for {}, stored only", group.folder);
            return Ok(None);
        }

        let since = store
            .get_state(&last_agent_key(&msg.chat_id))
            .await?
            .unwrap_or_default();
        let recent = store.recent_messages(&msg.chat_id, RECENT_CONTEXT).await?;
        let new = store.messages_since(&msg.chat_id, &since).await?;
        let new_count = new.len();

        let mut seen = HashSet::new();
        let mut messages: Vec<StoredMessage> = recent
            .into_iter()
            .chain(new)
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if messages.is_empty() {
            return Ok(None);
        }

        info!(
            "Processing message for {} ({} in context, {} new)",
            group.name,
            messages.len(),
            new_count
        );

        let prompt = build_prompt(&messages);
        let session = store.get_session(&group.folder).await?;

        if let Err(e) = self.ctx.channel.set_typing(&msg.chat_id, true).await {
            debug!("Failed to set typing indicator: {:#}", e);
        }
        let output = self
            .run_agent(&group, prompt, &msg.chat_id, session, false, true)
            .await;
        if let Err(e) = self.ctx.channel.set_typing(&msg.chat_id, false).await {
            debug!("Failed to clear typing indicator: {:#}", e);
        }

        if !output.is_success() {
            error!(
                "Agent error for {}: {}",
                group.name,
                output.error.as_deref().unwrap_or("unknown error")
            );
            return Ok(None);
        }

        let Some(reply) = output.result.filter(|r| !r.trim().is_empty()) else {
            return Ok(None);
        };

        store.set_state(&last_agent_key(&msg.chat_id), &timestamp).await?;
        self.ctx
            .send_message(&msg.chat_id, &reply, format!("bot-{}", msg.id))
            .await?;
        Ok(Some(reply))
    }
}

#[async_trait]
impl TaskExecutor for Orchestrator {
    async fn execute(&self, task: &ScheduledTask) -> TaskOutcome {
        let group = match self.ctx.store.group_by_folder(&task.group_folder).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                error!("Group not found for task {}: {}", task.id, task.group_folder);
                return TaskOutcome::Failed(format!("Group not found: {}", task.group_folder));
            }
            Err(e) => return TaskOutcome::Failed(format!("{:#}", e)),
        };

        let use_session = task.context_mode == ContextMode::Group;
        let session_id = if use_session {
            match self.ctx.store.get_session(&group.folder).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to load session for {}: {:#}", group.folder, e);
                    None
                }
            }
        } else {
            None
        };

        let output = self
            .run_agent(
                &group,
                task.prompt.clone(),
                &task.chat_id,
                session_id,
                true,
                use_session,
            )
            .await;

        if output.is_success() {
            TaskOutcome::Success(output.result)
        } else {
            TaskOutcome::Failed(output.error.unwrap_or_else(|| "Unknown error".to_string()))
        }
    }
}
