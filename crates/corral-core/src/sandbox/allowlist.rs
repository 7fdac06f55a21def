//! Mount allowlist: decides which host paths a sandbox may see
//!
//! The allowlist lives outside the project tree and is never mounted into any
//! sandbox. It is loaded once at startup; when it is missing or malformed every
//! additional mount is refused.

use corral_store::AdditionalMount;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{HostPaths, expand_home};

/// Prefix under which validated mounts appear inside the sandbox
pub const EXTRA_MOUNT_PREFIX: &str = "/workspace/extra";

/// Substrings that can never be mounted, whatever the allowlist says
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

/// A host directory tree under which mounts are permitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountAllowlist {
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
}

/// Why a requested mount was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountRejection {
    #[error("no usable mount allowlist: {0}")]
    NoAllowlist(String),

    #[error("invalid container path '{0}': must be a non-empty relative path without '..'")]
    InvalidContainerPath(String),

    #[error("host path does not exist: {0}")]
    HostPathMissing(String),

    #[error("path {path} matches blocked pattern '{pattern}'")]
    BlockedPattern { path: PathBuf, pattern: String },

    #[error("path {0} is not under any allowed root")]
    OutsideAllowedRoots(PathBuf),

    #[error("path {0} would expose the mount allowlist")]
    ExposesAllowlist(PathBuf),
}

/// A mount that passed validation, ready for the planner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
    pub reason: String,
}

/// Root with its canonical path resolved at load time
#[derive(Debug, Clone)]
struct ResolvedRoot {
    root: AllowedRoot,
    real_path: PathBuf,
}

/// Validates [`AdditionalMount`] requests against a loaded allowlist.
///
/// Holds the allowlist for the life of the process; a load failure is kept as
/// the reason every subsequent request is refused.
#[derive(Debug, Clone)]
pub struct MountValidator {
    policy: Result<Policy, String>,
}

#[derive(Debug, Clone)]
struct Policy {
    roots: Vec<ResolvedRoot>,
    blocked: Vec<String>,
    non_main_read_only: bool,
    /// Canonical location of the allowlist file, never mountable
    source: Option<PathBuf>,
}

impl MountValidator {
    /// Load the configured allowlist, refusing one that a sandbox could reach.
    ///
    /// Every tree below the project root, the groups dir or the data dir ends
    /// up inside some sandbox, so an allowlist stored there is ignored.
    pub fn load_for_host(paths: &HostPaths) -> Self {
        let real = match paths.mount_allowlist.canonicalize() {
            Ok(real) => real,
            Err(_) => return Self::load(&paths.mount_allowlist),
        };
        let exposed = [&paths.project_root, &paths.groups_dir, &paths.data_dir]
            .into_iter()
            .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
            .find(|dir| real.starts_with(dir));
        if let Some(dir) = exposed {
            let reason = format!(
                "{} lies inside {}, which is visible to sandboxes",
                real.display(),
                dir.display()
            );
            warn!("Mount allowlist refused, additional mounts are disabled: {}", reason);
            return Self::unavailable(reason);
        }
        Self::load(&real)
    }

    /// Load the allowlist from `path`, failing closed on any problem
    pub fn load(path: &Path) -> Self {
        let loaded = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))
            .and_then(|content| {
                serde_json::from_str::<MountAllowlist>(&content)
                    .map_err(|e| format!("cannot parse {}: {}", path.display(), e))
            });

        match loaded {
            Ok(allowlist) => {
                info!(
                    "Loaded mount allowlist from {} ({} root(s))",
                    path.display(),
                    allowlist.allowed_roots.len()
                );
                let mut validator = Self::from_allowlist(allowlist);
                if let Ok(policy) = validator.policy.as_mut() {
                    policy.source = path.canonicalize().ok();
                }
                validator
            }
            Err(reason) => {
                warn!("Mount allowlist unavailable, additional mounts are disabled: {}", reason);
                Self::unavailable(reason)
            }
        }
    }

    /// Build from an in-memory allowlist. The default blocked patterns are always merged in.
    pub fn from_allowlist(allowlist: MountAllowlist) -> Self {
        let mut blocked: Vec<String> = DEFAULT_BLOCKED_PATTERNS.iter().map(|p| p.to_string()).collect();
        for pattern in allowlist.blocked_patterns {
            if !pattern.is_empty() && !blocked.contains(&pattern) {
                blocked.push(pattern);
            }
        }

        let roots = allowlist
            .allowed_roots
            .into_iter()
            .filter_map(|root| match expand_home(&root.path).canonicalize() {
                Ok(real_path) => Some(ResolvedRoot { root, real_path }),
                Err(e) => {
                    warn!("Ignoring allowed root {}: {}", root.path, e);
                    None
                }
            })
            .collect();

        Self {
            policy: Ok(Policy {
                roots,
                blocked,
                non_main_read_only: allowlist.non_main_read_only,
                source: None,
            }),
        }
    }

    /// A validator that refuses everything with `reason`
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            policy: Err(reason.into()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.policy.is_ok()
    }

    /// Check one requested mount
    pub fn validate(
        &self,
        mount: &AdditionalMount,
        is_privileged: bool,
    ) -> Result<ValidatedMount, MountRejection> {
        let policy = self
            .policy
            .as_ref()
            .map_err(|reason| MountRejection::NoAllowlist(reason.clone()))?;

        if !is_safe_container_path(&mount.container_path) {
            return Err(MountRejection::InvalidContainerPath(mount.container_path.clone()));
        }

        let real_path = expand_home(&mount.host_path)
            .canonicalize()
            .map_err(|_| MountRejection::HostPathMissing(mount.host_path.clone()))?;

        if let Some(pattern) = matching_blocked_pattern(&real_path, &policy.blocked) {
            return Err(MountRejection::BlockedPattern {
                path: real_path,
                pattern,
            });
        }

        if let Some(source) = &policy.source
            && source.starts_with(&real_path)
        {
            return Err(MountRejection::ExposesAllowlist(real_path));
        }

        let root = policy
            .roots
            .iter()
            .find(|r| real_path.starts_with(&r.real_path))
            .ok_or_else(|| MountRejection::OutsideAllowedRoots(real_path.clone()))?;

        let mut readonly = true;
        if !mount.readonly {
            if !is_privileged && policy.non_main_read_only {
                debug!("Forcing read-only for non-main mount {}", real_path.display());
            } else if !root.root.allow_read_write {
                debug!(
                    "Root {} does not allow read-write, forcing read-only",
                    root.real_path.display()
                );
            } else {
                readonly = false;
            }
        }

        let reason = match &root.root.description {
            Some(desc) => format!("Allowed under root {} ({})", root.real_path.display(), desc),
            None => format!("Allowed under root {}", root.real_path.display()),
        };

        Ok(ValidatedMount {
            host_path: real_path,
            container_path: format!("{}/{}", EXTRA_MOUNT_PREFIX, mount.container_path),
            readonly,
            reason,
        })
    }

    /// Validate a tenant's requested mounts, dropping and logging rejections
    pub fn validate_all(
        &self,
        mounts: &[AdditionalMount],
        group_name: &str,
        is_privileged: bool,
    ) -> Vec<ValidatedMount> {
        mounts
            .iter()
            .filter_map(|mount| match self.validate(mount, is_privileged) {
                Ok(validated) => {
                    debug!(
                        "Mount {} -> {} validated for {} ({})",
                        validated.host_path.display(),
                        validated.container_path,
                        group_name,
                        validated.reason
                    );
                    Some(validated)
                }
                Err(rejection) => {
                    warn!(
                        "Rejected additional mount {} for group {}: {}",
                        mount.host_path, group_name, rejection
                    );
                    None
                }
            })
            .collect()
    }
}

/// Relative, non-empty, and free of `..` on a per-component basis
fn is_safe_container_path(raw: &str) -> bool {
    if raw.trim().is_empty() {
        return false;
    }
    let path = Path::new(raw);
    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    has_name && !raw.contains(':')
}

fn matching_blocked_pattern(path: &Path, blocked: &[String]) -> Option<String> {
    let full = path.to_string_lossy();
    for pattern in blocked {
        let in_component = path
            .components()
            .any(|c| c.as_os_str().to_string_lossy().contains(pattern.as_str()));
        if in_component || full.contains(pattern.as_str()) {
            return Some(pattern.clone());
        }
    }
    None
}

/// Example allowlist written by `corral allowlist template`
pub fn allowlist_template() -> MountAllowlist {
    MountAllowlist {
        allowed_roots: vec![
            AllowedRoot {
                path: "~/projects".to_string(),
                allow_read_write: true,
                description: Some("Development projects".to_string()),
            },
            AllowedRoot {
                path: "~/Documents/work".to_string(),
                allow_read_write: false,
                description: Some("Work documents (read-only)".to_string()),
            },
        ],
        blocked_patterns: vec!["password".to_string(), "secret".to_string(), "token".to_string()],
        non_main_read_only: true,
    }
}
