use crate::limits::ResourceLimits;
use crate::process::{parse_pids, send_signal};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_KILL: &str = "cgroup.kill";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/corral";

const CONTROLLERS: &str = "+cpu +memory +pids";
const RELEASE_RETRIES: u32 = 5;
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);

/// A per-container cgroup v2 directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    name: String,
    path: PathBuf,
}

impl ResourceGroup {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn procs_path(&self) -> PathBuf {
        self.path.join(CGROUP_PROCS)
    }

    pub fn members(&self) -> io::Result<Vec<u32>> {
        fs::read_to_string(self.procs_path()).map(|c| parse_pids(&c))
    }

    /// Send `signal` to every process in the group. Returns how many were
    /// signalled.
    pub fn signal_members(&self, signal: i32) -> Result<usize, RuntimeError> {
        let members = self
            .members()
            .map_err(|e| resource_io("list members of", &self.path, &e))?;
        for pid in &members {
            send_signal(*pid, signal)?;
        }
        Ok(members.len())
    }
}

/// Manages resource groups below a single cgroup v2 subtree.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
}

impl Default for CgroupController {
    fn default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT)
    }
}

impl CgroupController {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group(&self, name: &str) -> ResourceGroup {
        ResourceGroup::new(name, self.root.join(name))
    }

    /// Create the group and write every limit before anything joins it.
    pub fn enroll(&self, name: &str, limits: &ResourceLimits) -> Result<ResourceGroup, RuntimeError> {
        limits.validate()?;
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(RuntimeError::Resource(format!("invalid group name: {name:?}")));
        }

        fs::create_dir_all(&self.root).map_err(|e| resource_io("create", &self.root, &e))?;
        if let Some(parent) = self.root.parent() {
            enable_controllers(parent);
        }
        enable_controllers(&self.root);

        let group = self.group(name);
        fs::create_dir(group.path()).map_err(|e| resource_io("create", group.path(), &e))?;

        if let Err(e) = write_limits(group.path(), limits) {
            self.release(&group);
            return Err(e);
        }

        info!(
            "enrolled group {name}: memory.max={} pids.max={} cpu.weight={}",
            limits.memory_max(),
            limits.pids_max_value(),
            limits.cpu_weight()
        );
        Ok(group)
    }

    pub fn attach(&self, group: &ResourceGroup, pid: u32) -> Result<(), RuntimeError> {
        write_cgroup_file(&group.procs_path(), &pid.to_string())
            .map_err(|e| resource_io("attach pid to", group.path(), &e))?;
        debug!("attached pid {pid} to group {}", group.name());
        Ok(())
    }

    /// Remove the group. Never fails: an already-removed group is fine, a
    /// busy one is killed and retried, anything else is logged.
    pub fn release(&self, group: &ResourceGroup) {
        let path = group.path();
        let mut attempt = 0;
        loop {
            match fs::remove_dir(path) {
                Ok(()) => {
                    debug!("released group {}", group.name());
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("group {} already released", group.name());
                    return;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < RELEASE_RETRIES => {
                    attempt += 1;
                    debug!(
                        "group {} busy, killing members (attempt {attempt})",
                        group.name()
                    );
                    if let Err(e) = write_cgroup_file(&path.join(CGROUP_KILL), "1") {
                        debug!("cgroup.kill for {} failed: {e}", group.name());
                    }
                    thread::sleep(RELEASE_BACKOFF * attempt);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                    // Plain directories (no cgroupfs) still carry limit files.
                    if let Err(e) = fs::remove_dir_all(path) {
                        warn!("failed to remove group {}: {e}", group.name());
                    }
                    return;
                }
                Err(e) => {
                    warn!("failed to remove group {}: {e}", group.name());
                    return;
                }
            }
        }
    }
}

fn resource_io(action: &str, path: &Path, e: &io::Error) -> RuntimeError {
    RuntimeError::Resource(format!("failed to {action} {}: {e}", path.display()))
}

fn write_limits(dir: &Path, limits: &ResourceLimits) -> Result<(), RuntimeError> {
    let files = [
        ("pids.max", limits.pids_max_value()),
        ("memory.max", limits.memory_max()),
        ("cpu.weight", limits.cpu_weight().to_string()),
        ("cpu.max", limits.cpu_max()),
    ];
    for (file, value) in &files {
        let path = dir.join(file);
        write_cgroup_file(&path, value).map_err(|e| resource_io("write", &path, &e))?;
    }
    Ok(())
}

/// Best effort: delegating controllers can fail on hosts that already did it
/// or never will. Files that don't exist are left alone.
fn enable_controllers(dir: &Path) {
    let path = dir.join(CGROUP_SUBTREE_CONTROL);
    match fs::OpenOptions::new().write(true).open(&path) {
        Ok(mut file) => {
            if let Err(e) = file.write_all(CONTROLLERS.as_bytes()) {
                debug!("enabling controllers in {} failed: {e}", path.display());
            }
        }
        Err(e) => debug!("no subtree control at {}: {e}", path.display()),
    }
}

fn write_cgroup_file(path: &Path, data: &str) -> io::Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?
        .write_all(data.as_bytes())
}
