//! Sandbox execution: mount policy, mount planning and the container runner

pub mod allowlist;
pub mod docker;
pub mod mounts;
pub mod output;

pub use allowlist::{
    AllowedRoot, DEFAULT_BLOCKED_PATTERNS, MountAllowlist, MountRejection, MountValidator,
    ValidatedMount, allowlist_template,
};
pub use docker::{AgentRunner, ContainerRunner, RunnerConfig};
pub use mounts::{MountPlan, MountPlanner, VolumeMount};
pub use output::{ContainerInput, ContainerOutput, ImageAttachment, OutputStatus, parse_output};
