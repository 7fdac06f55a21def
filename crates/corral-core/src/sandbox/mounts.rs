//! Per-run volume mount plan
//!
//! The privileged tenant sees the whole project root; every other tenant only
//! sees its own folder plus the read-only shared area. Each tenant gets its own
//! session and IPC directories, so no two tenants ever share a writable path.

use anyhow::{Context, Result};
use corral_store::RegisteredGroup;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::allowlist::MountValidator;
use crate::config::HostPaths;
use crate::ipc::write_atomic;

pub const PROJECT_MOUNT: &str = "/workspace/project";
pub const GROUP_MOUNT: &str = "/workspace/group";
pub const GLOBAL_MOUNT: &str = "/workspace/global";
pub const IDENTITY_MOUNT: &str = "/workspace/group/IDENTITY.md";
pub const SESSION_MOUNT: &str = "/home/agent/.agent";
pub const IPC_MOUNT: &str = "/workspace/ipc";
pub const ENV_MOUNT: &str = "/workspace/env-dir";

/// Folder shared read-only with non-privileged tenants
pub const GLOBAL_FOLDER: &str = "global";

/// A resolved host to sandbox binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    fn new(host_path: impl Into<PathBuf>, container_path: &str, readonly: bool) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.to_string(),
            readonly,
        }
    }

    /// Value for the runtime's `-v` flag
    pub fn volume_arg(&self) -> String {
        if self.readonly {
            format!("{}:{}:ro", self.host_path.display(), self.container_path)
        } else {
            format!("{}:{}", self.host_path.display(), self.container_path)
        }
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.host_path.display(), self.container_path)?;
        if self.readonly {
            f.write_str(" (ro)")?;
        }
        Ok(())
    }
}

/// Everything the runner needs to bind a tenant's sandbox
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    pub mounts: Vec<VolumeMount>,
    /// Variables passed by name; values never appear in argv
    pub env: Vec<(String, String)>,
}

pub struct MountPlanner {
    paths: HostPaths,
    validator: MountValidator,
    credential_keys: Vec<String>,
}

impl MountPlanner {
    pub fn new(paths: HostPaths, validator: MountValidator, credential_keys: Vec<String>) -> Self {
        Self {
            paths,
            validator,
            credential_keys,
        }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn validator(&self) -> &MountValidator {
        &self.validator
    }

    /// Plan using credentials from the process environment
    pub async fn plan(&self, group: &RegisteredGroup, is_privileged: bool) -> Result<MountPlan> {
        self.plan_with_env(group, is_privileged, |key| std::env::var(key).ok())
            .await
    }

    pub async fn plan_with_env(
        &self,
        group: &RegisteredGroup,
        is_privileged: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<MountPlan> {
        let group_dir = self.paths.groups_dir.join(&group.folder);
        tokio::fs::create_dir_all(group_dir.join("logs"))
            .await
            .with_context(|| format!("Failed to create group dir {:?}", group_dir))?;

        let mut mounts = Vec::new();
        if is_privileged {
            mounts.push(VolumeMount::new(&self.paths.project_root, PROJECT_MOUNT, false));
            mounts.push(VolumeMount::new(&group_dir, GROUP_MOUNT, false));
        } else {
            mounts.push(VolumeMount::new(&group_dir, GROUP_MOUNT, false));
            let global_dir = self.paths.groups_dir.join(GLOBAL_FOLDER);
            if global_dir.is_dir() {
                mounts.push(VolumeMount::new(global_dir, GLOBAL_MOUNT, true));
            }
        }

        let identity = self.paths.data_dir.join("IDENTITY.md");
        if identity.is_file() {
            mounts.push(VolumeMount::new(identity, IDENTITY_MOUNT, true));
        }

        let sessions_dir = self.paths.data_dir.join("sessions").join(&group.folder).join(".agent");
        tokio::fs::create_dir_all(&sessions_dir)
            .await
            .with_context(|| format!("Failed to create sessions dir {:?}", sessions_dir))?;
        mounts.push(VolumeMount::new(sessions_dir, SESSION_MOUNT, false));

        let ipc_dir = self.paths.ipc_dir().join(&group.folder);
        for queue in ["messages", "tasks"] {
            tokio::fs::create_dir_all(ipc_dir.join(queue))
                .await
                .with_context(|| format!("Failed to create IPC dir {:?}", ipc_dir))?;
        }
        mounts.push(VolumeMount::new(ipc_dir, IPC_MOUNT, false));

        let credentials = self.collect_credentials(group, &env).await;
        if !credentials.is_empty() {
            let env_dir = self.paths.data_dir.join("env").join(&group.folder);
            tokio::fs::create_dir_all(&env_dir)
                .await
                .with_context(|| format!("Failed to create env dir {:?}", env_dir))?;
            let body: String = credentials
                .iter()
                .map(|(k, v)| format!("{}={}\n", k, v))
                .collect();
            write_atomic(&env_dir.join("env"), body.as_bytes()).await?;
            mounts.push(VolumeMount::new(env_dir, ENV_MOUNT, true));
        }

        if let Some(extra) = group.container_config.as_ref().map(|c| &c.additional_mounts)
            && !extra.is_empty()
        {
            for validated in self.validator.validate_all(extra, &group.name, is_privileged) {
                mounts.push(VolumeMount {
                    host_path: validated.host_path,
                    container_path: validated.container_path,
                    readonly: validated.readonly,
                });
            }
        }

        debug!(
            "Planned {} mount(s) for group {}: {:?}",
            mounts.len(),
            group.name,
            mounts.iter().map(|m| m.to_string()).collect::<Vec<_>>()
        );

        Ok(MountPlan {
            mounts,
            env: credentials.into_iter().collect(),
        })
    }

    /// Allow-listed credentials plus the tenant's own variables
    async fn collect_credentials(
        &self,
        group: &RegisteredGroup,
        env: &impl Fn(&str) -> Option<String>,
    ) -> BTreeMap<String, String> {
        let dotenv = read_dotenv(&self.paths.project_root.join(".env")).await;
        let mut vars = BTreeMap::new();
        for key in &self.credential_keys {
            let value = env(key).or_else(|| dotenv.get(key).cloned());
            if let Some(value) = value
                && !value.is_empty()
            {
                vars.insert(key.clone(), value);
            }
        }

        if let Some(config) = &group.container_config {
            for (key, value) in &config.env {
                if is_valid_env_key(key) && !value.contains('\n') {
                    vars.insert(key.clone(), value.clone());
                } else {
                    warn!("Ignoring invalid env entry '{}' for group {}", key, group.name);
                }
            }
        }
        vars
    }
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse `KEY=VALUE` lines, ignoring comments and blanks
async fn read_dotenv(path: &Path) -> BTreeMap<String, String> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return BTreeMap::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
