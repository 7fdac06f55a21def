//! Supervisor configuration
//!
//! Loaded from a TOML file where every field has a default, then overridden by
//! a handful of environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorralConfig {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    /// Folder of the privileged tenant
    #[serde(default = "default_main_group_folder")]
    pub main_group_folder: String,

    /// Chat bound to the privileged tenant on first contact
    #[serde(default)]
    pub main_chat_id: Option<String>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub ipc: IpcSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_assistant_name() -> String {
    "Andy".to_string()
}

fn default_main_group_folder() -> String {
    "main".to_string()
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            main_group_folder: default_main_group_folder(),
            main_chat_id: None,
            paths: PathsConfig::default(),
            container: ContainerSettings::default(),
            scheduler: SchedulerSettings::default(),
            ipc: IpcSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Filesystem layout; unset entries derive from the project root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default)]
    pub groups_dir: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Must live outside the project root so no sandbox can see it
    #[serde(default)]
    pub mount_allowlist: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_start_marker")]
    pub output_start_marker: String,
    #[serde(default = "default_end_marker")]
    pub output_end_marker: String,
    /// Variables forwarded into the sandbox; nothing else from the host environment is
    #[serde(default = "default_credential_keys")]
    pub credential_keys: Vec<String>,
}

fn default_binary() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "corral-agent:latest".to_string()
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_start_marker() -> String {
    "---CORRAL_OUTPUT_START---".to_string()
}

fn default_end_marker() -> String {
    "---CORRAL_OUTPUT_END---".to_string()
}

fn default_credential_keys() -> Vec<String> {
    [
        "ANTHROPIC_API_KEY",
        "OPENAI_API_KEY",
        "GEMINI_API_KEY",
        "GROQ_API_KEY",
        "OPENROUTER_API_KEY",
        "MISTRAL_API_KEY",
        "AWS_BEARER_TOKEN_BEDROCK",
        "AWS_REGION",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            image: default_image(),
            timeout_ms: default_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            output_start_marker: default_start_marker(),
            output_end_marker: default_end_marker(),
            credential_keys: default_credential_keys(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_scheduler_poll")]
    pub poll_interval_secs: u64,
    /// IANA name used to evaluate cron expressions and naive one-shot times
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_scheduler_poll() -> u64 {
    60
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_scheduler_poll(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcSettings {
    #[serde(default = "default_ipc_poll")]
    pub poll_interval_ms: u64,
}

fn default_ipc_poll() -> u64 {
    1000
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_ipc_poll(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Write full input, mounts, stdout and stderr into container run logs
    #[serde(default)]
    pub verbose_container_logs: bool,
}

/// Concrete paths derived from [`PathsConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub mount_allowlist: PathBuf,
}

impl HostPaths {
    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }
}

impl CorralConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("corral")
            .join("config.toml")
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(name) = env("ASSISTANT_NAME") {
            self.assistant_name = name;
        }
        if let Some(chat) = env("MAIN_CHAT_ID") {
            self.main_chat_id = Some(chat);
        }
        if let Some(path) = env("MOUNT_ALLOWLIST_PATH") {
            self.paths.mount_allowlist = Some(PathBuf::from(path));
        }
        if let Some(binary) = env("CONTAINER_BINARY") {
            self.container.binary = binary;
        }
        if let Some(image) = env("CONTAINER_IMAGE") {
            self.container.image = image;
        }
        if let Some(raw) = env("CONTAINER_TIMEOUT") {
            match raw.parse() {
                Ok(ms) => self.container.timeout_ms = ms,
                Err(_) => warn!("Ignoring invalid CONTAINER_TIMEOUT '{}'", raw),
            }
        }
        if let Some(raw) = env("CONTAINER_MAX_OUTPUT_SIZE") {
            match raw.parse() {
                Ok(bytes) => self.container.max_output_bytes = bytes,
                Err(_) => warn!("Ignoring invalid CONTAINER_MAX_OUTPUT_SIZE '{}'", raw),
            }
        }
        if let Some(tz) = env("TZ") {
            self.scheduler.timezone = tz;
        }
        if let Some(level) = env("LOG_LEVEL")
            && matches!(level.to_lowercase().as_str(), "debug" | "trace")
        {
            self.logging.verbose_container_logs = true;
        }
    }

    /// Resolve every path, anchoring relative ones at the project root
    pub fn resolve_paths(&self) -> Result<HostPaths> {
        let project_root = match &self.paths.project_root {
            Some(root) => expand_home(&root.to_string_lossy()),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let anchored = |configured: &Option<PathBuf>, fallback: PathBuf| match configured {
            Some(p) => {
                let expanded = expand_home(&p.to_string_lossy());
                if expanded.is_absolute() {
                    expanded
                } else {
                    project_root.join(expanded)
                }
            }
            None => fallback,
        };

        let groups_dir = anchored(&self.paths.groups_dir, project_root.join("groups"));
        let data_dir = anchored(&self.paths.data_dir, project_root.join("data"));
        let store_path = anchored(
            &self.paths.store_path,
            project_root.join("store").join("corral.db"),
        );
        let mount_allowlist = match &self.paths.mount_allowlist {
            Some(p) => expand_home(&p.to_string_lossy()),
            None => default_allowlist_path(),
        };

        Ok(HostPaths {
            project_root,
            groups_dir,
            data_dir,
            store_path,
            mount_allowlist,
        })
    }

    pub fn container_timeout(&self) -> Duration {
        Duration::from_millis(self.container.timeout_ms)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.max(1))
    }

    pub fn ipc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ipc.poll_interval_ms.max(10))
    }
}

/// `~/.config/corral/mount-allowlist.json`
pub fn default_allowlist_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".config")
        .join("corral")
        .join("mount-allowlist.json")
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = CorralConfig::from_toml("").unwrap();
        assert_eq!(config.assistant_name, "Andy");
        assert_eq!(config.main_group_folder, "main");
        assert_eq!(config.container.timeout_ms, 300_000);
        assert_eq!(config.container.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.ipc.poll_interval_ms, 1000);
        assert!(config.container.credential_keys.contains(&"ANTHROPIC_API_KEY".to_string()));
    }

    #[test]
    fn test_partial_toml() {
        let config = CorralConfig::from_toml(
            r#"
            assistant_name = "Bob"

            [container]
            image = "agent:dev"
            timeout_ms = 1000

            [scheduler]
            timezone = "Europe/Berlin"
            "#,
        )
        .unwrap();
        assert_eq!(config.assistant_name, "Bob");
        assert_eq!(config.container.image, "agent:dev");
        assert_eq!(config.container.binary, "docker");
        assert_eq!(config.container_timeout(), Duration::from_secs(1));
        assert_eq!(config.scheduler.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONTAINER_IMAGE", "custom:1"),
            ("CONTAINER_TIMEOUT", "5000"),
            ("CONTAINER_MAX_OUTPUT_SIZE", "not-a-number"),
            ("TZ", "America/New_York"),
            ("LOG_LEVEL", "DEBUG"),
        ]);
        let mut config = CorralConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.container.image, "custom:1");
        assert_eq!(config.container.timeout_ms, 5000);
        assert_eq!(config.container.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.scheduler.timezone, "America/New_York");
        assert!(config.logging.verbose_container_logs);
    }

    #[test]
    fn test_resolve_paths_relative_to_project_root() {
        let mut config = CorralConfig::default();
        config.paths.project_root = Some(PathBuf::from("/srv/corral"));
        config.paths.data_dir = Some(PathBuf::from("state"));
        config.paths.mount_allowlist = Some(PathBuf::from("/etc/corral/allow.json"));

        let paths = config.resolve_paths().unwrap();
        assert_eq!(paths.groups_dir, PathBuf::from("/srv/corral/groups"));
        assert_eq!(paths.data_dir, PathBuf::from("/srv/corral/state"));
        assert_eq!(paths.ipc_dir(), PathBuf::from("/srv/corral/state/ipc"));
        assert_eq!(paths.store_path, PathBuf::from("/srv/corral/store/corral.db"));
        assert_eq!(paths.mount_allowlist, PathBuf::from("/etc/corral/allow.json"));
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/projects"), home.join("projects"));
            assert_eq!(expand_home("~"), home);
        }
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
