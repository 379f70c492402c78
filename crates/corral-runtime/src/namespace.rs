use crate::cgroup::{CgroupController, ResourceGroup};
use crate::limits::ResourceLimits;
use crate::process::{child_pids, send_signal, ChildProcess, ExitOutcome, ProcessHandle, ProcessIo};
use crate::provider::{IsolationProvider, LaunchSpec, StdioMode};
use crate::RuntimeError;
use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ENV_CGROUP_PROCS: &str = "CORRAL_CGROUP_PROCS";
pub const ENV_HOSTNAME: &str = "CORRAL_HOSTNAME";
pub const ENV_ROOTFS: &str = "CORRAL_ROOTFS";

/// Exit status of the launch prelude when it could not join the cgroup.
pub const ENROLL_FAILED_EXIT: i32 = 125;
/// Exit status of the init script when /proc could not be mounted.
pub const MOUNT_FAILED_EXIT: i32 = 126;

const INIT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);
const INIT_RESOLVE_POLL: Duration = Duration::from_millis(2);

/// Runs as pid 1 of the new namespaces with the workload as "$@".
const INIT_SCRIPT: &str = r#"hostname "$CORRAL_HOSTNAME" 2>/dev/null || echo "$CORRAL_HOSTNAME" > /proc/sys/kernel/hostname 2>/dev/null || true
if [ -n "$CORRAL_ROOTFS" ]; then
  root=$CORRAL_ROOTFS
  mkdir -p "$root/proc"
  mount -t proc proc "$root/proc" || exit 126
  unset CORRAL_ROOTFS CORRAL_HOSTNAME CORRAL_CGROUP_PROCS
  exec chroot "$root" "$@"
fi
mount -t proc proc /proc 2>/dev/null || true
unset CORRAL_ROOTFS CORRAL_HOSTNAME CORRAL_CGROUP_PROCS
exec "$@"
"#;

fn shell_quote(s: &str) -> String {
    // Single-quoting in POSIX shell: replace ' with '\'' then wrap in '
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn build_unshare_args() -> [&'static str; 6] {
    [
        "--pid",
        "--mount",
        "--net",
        "--uts",
        "--fork",
        "--kill-child=SIGTERM",
    ]
}

/// The outer prelude joins the cgroup with its own pid, then execs into
/// `unshare`, so every descendant starts out confined.
fn build_prelude(stdio: StdioMode) -> String {
    let mut script = String::new();
    if stdio == StdioMode::Piped {
        script.push_str("exec 2>&1\n");
    }
    let _ = writeln!(
        script,
        "echo $$ > \"${ENV_CGROUP_PROCS}\" || exit {ENROLL_FAILED_EXIT}"
    );
    let _ = write!(
        script,
        "exec unshare {} /bin/sh -c {} corral-init \"$@\"",
        build_unshare_args().join(" "),
        shell_quote(INIT_SCRIPT)
    );
    script
}

fn build_launch_command(spec: &LaunchSpec, group: &ResourceGroup) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(build_prelude(spec.stdio))
        .arg("corral-launch")
        .arg(&spec.command)
        .args(&spec.args);

    cmd.env(ENV_CGROUP_PROCS, group.procs_path())
        .env(ENV_HOSTNAME, &spec.hostname);
    match &spec.rootfs {
        Some(root) => cmd.env(ENV_ROOTFS, root),
        None => cmd.env_remove(ENV_ROOTFS),
    };

    match spec.stdio {
        StdioMode::Inherit => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioMode::Null => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        StdioMode::Piped => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null());
        }
    }
    cmd
}

/// A launched container: the `unshare` process we spawned and the init
/// process it forked into the new pid namespace.
///
/// `unshare` blocks SIGTERM and only forwards its own death, so stop signals
/// go to init directly and SIGKILL goes to the whole group. Exit status is
/// collected from `unshare`, which exits with its child's status.
pub struct NamespaceProcess {
    launcher: ChildProcess,
    init: Option<u32>,
    group: ResourceGroup,
}

impl NamespaceProcess {
    fn launch(mut launcher: ChildProcess, group: ResourceGroup) -> Result<Self, RuntimeError> {
        let init = resolve_init(&mut launcher)?;
        Ok(Self {
            launcher,
            init,
            group,
        })
    }

    /// Pid of the `unshare` process.
    pub fn launcher_pid(&self) -> u32 {
        self.launcher.pid()
    }

    /// Pid of the workload's init process, if it could be identified.
    pub fn init_pid(&self) -> Option<u32> {
        self.init
    }

    fn exited(&mut self) -> Result<bool, RuntimeError> {
        Ok(self.launcher.try_wait()?.is_some())
    }
}

/// Wait for `unshare` to fork its child. `None` if the kernel does not list
/// children or the launcher is already gone.
fn resolve_init(launcher: &mut ChildProcess) -> Result<Option<u32>, RuntimeError> {
    let pid = launcher.pid();
    let deadline = Instant::now() + INIT_RESOLVE_TIMEOUT;
    loop {
        match child_pids(pid) {
            Ok(children) => {
                if let Some(&init) = children.first() {
                    return Ok(Some(init));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("cannot list children of pid {pid}: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if launcher.try_wait()?.is_some() {
            return Ok(None);
        }
        if Instant::now() >= deadline {
            warn!("pid {pid} has not forked its init process yet");
            return Ok(None);
        }
        thread::sleep(INIT_RESOLVE_POLL);
    }
}

impl ProcessHandle for NamespaceProcess {
    fn pid(&self) -> u32 {
        self.init.unwrap_or_else(|| self.launcher.pid())
    }

    fn terminate(&mut self) -> Result<(), RuntimeError> {
        if self.exited()? {
            return Ok(());
        }
        match self.init {
            Some(init) => send_signal(init, libc::SIGTERM),
            None => self.group.signal_members(libc::SIGTERM).map(|_| ()),
        }
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        if self.exited()? {
            return Ok(());
        }
        match self.group.signal_members(libc::SIGKILL) {
            Ok(n) => debug!("sent SIGKILL to {n} members of group {}", self.group.name()),
            Err(e) => {
                warn!("cannot kill group {}: {e}", self.group.name());
                if let Some(init) = self.init {
                    send_signal(init, libc::SIGKILL)?;
                }
            }
        }
        self.launcher.kill()
    }

    fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        self.launcher.wait()
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, RuntimeError> {
        self.launcher.try_wait()
    }

    fn take_io(&mut self) -> Option<ProcessIo> {
        self.launcher.take_io()
    }
}

/// Production isolation: cgroup v2 groups plus `unshare`-created
/// pid/mount/net/uts namespaces.
#[derive(Debug, Default)]
pub struct NamespaceProvider {
    cgroups: CgroupController,
}

impl NamespaceProvider {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroups: CgroupController::new(cgroup_root),
        }
    }

    pub fn cgroups(&self) -> &CgroupController {
        &self.cgroups
    }
}

impl IsolationProvider for NamespaceProvider {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn enroll(&self, group: &str, limits: &ResourceLimits) -> Result<ResourceGroup, RuntimeError> {
        self.cgroups.enroll(group, limits)
    }

    fn release(&self, group: &ResourceGroup) {
        self.cgroups.release(group);
    }

    fn spawn(
        &self,
        spec: &LaunchSpec,
        group: &ResourceGroup,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        if let Some(root) = &spec.rootfs {
            if !root.is_dir() {
                return Err(RuntimeError::Namespace(format!(
                    "root filesystem {} does not exist",
                    root.display()
                )));
            }
        }

        let mut cmd = build_launch_command(spec, group);
        debug!("launching {} in group {}", spec.command, group.name());
        let child = cmd.spawn().map_err(|e| {
            RuntimeError::Namespace(format!("failed to spawn isolation launcher: {e}"))
        })?;
        let mut handle = ChildProcess::new(child);
        let pid = handle.pid();

        // The prelude already joined; confirm from here so an enrollment
        // failure surfaces as an error instead of a short-lived container.
        if let Err(e) = self.cgroups.attach(group, pid) {
            match handle.try_wait()? {
                Some(ExitOutcome::Code(ENROLL_FAILED_EXIT)) => {
                    return Err(RuntimeError::Resource(format!(
                        "process could not join group {}",
                        group.name()
                    )));
                }
                Some(outcome) => {
                    debug!("pid {pid} exited before attach confirmation: {outcome:?}");
                }
                None => {
                    warn!("pid {pid} is running outside its group, killing it");
                    let _ = handle.kill();
                    let _ = handle.wait();
                    return Err(e);
                }
            }
        }

        let process = NamespaceProcess::launch(handle, group.clone())?;
        info!(
            "started {} ({}): launcher pid {pid}, init pid {}",
            spec.hostname,
            spec.command,
            process.pid()
        );
        Ok(Box::new(process))
    }
}
