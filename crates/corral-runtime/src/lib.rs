//! Isolation layer for corral containers.
//!
//! This crate owns everything that touches the kernel on a container's
//! behalf: cgroup v2 resource groups (`cgroup`), the namespace launcher that
//! starts a command as pid 1 of fresh pid/mount/net/uts namespaces
//! (`namespace`), and handles to the resulting processes (`process`). The
//! `IsolationProvider` trait is the seam between lifecycle code and the OS;
//! `MockProvider` stands in for it in tests.

pub mod cgroup;
pub mod limits;
pub mod mock;
pub mod namespace;
pub mod prereq;
pub mod process;
pub mod provider;

pub use cgroup::{CgroupController, ResourceGroup};
pub use limits::ResourceLimits;
pub use mock::{MockProcess, MockProvider};
pub use namespace::{NamespaceProcess, NamespaceProvider};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use process::{ChildProcess, DetachedProcess, ExitOutcome, ProcessHandle, ProcessIo};
pub use provider::{select_provider, IsolationProvider, LaunchSpec, StdioMode};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("namespace setup failed: {0}")]
    Namespace(String),
    #[error("resource control failed: {0}")]
    Resource(String),
    #[error("process execution failed: {0}")]
    Exec(String),
}
