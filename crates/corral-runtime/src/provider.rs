use crate::cgroup::ResourceGroup;
use crate::limits::ResourceLimits;
use crate::process::ProcessHandle;
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a container's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Share the daemon's streams.
    Inherit,
    #[default]
    Null,
    /// stdin/stdout piped for the attach relay; stderr folded into stdout.
    Piped,
}

/// Everything needed to launch one container init process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub hostname: String,
    /// Root filesystem to chroot into; `None` runs against the host tree.
    pub rootfs: Option<PathBuf>,
    pub stdio: StdioMode,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>, hostname: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            hostname: hostname.into(),
            rootfs: None,
            stdio: StdioMode::default(),
        }
    }
}

/// Kernel-facing operations a container needs: resource groups and
/// namespaced process launch.
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create the group for `group` with every limit applied. Nothing runs
    /// in it yet.
    fn enroll(&self, group: &str, limits: &ResourceLimits) -> Result<ResourceGroup, RuntimeError>;

    /// Tear the group down. Best effort and idempotent.
    fn release(&self, group: &ResourceGroup);

    /// Start `spec` inside fresh namespaces, confined to `group` before the
    /// command gets to run.
    fn spawn(
        &self,
        spec: &LaunchSpec,
        group: &ResourceGroup,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError>;
}

pub fn select_provider(
    name: &str,
    cgroup_root: &Path,
) -> Result<Arc<dyn IsolationProvider>, RuntimeError> {
    match name {
        "namespace" => Ok(Arc::new(crate::namespace::NamespaceProvider::new(
            cgroup_root,
        ))),
        "mock" => Ok(Arc::new(crate::mock::MockProvider::new())),
        other => Err(RuntimeError::Namespace(format!(
            "unknown isolation provider '{other}'"
        ))),
    }
}
