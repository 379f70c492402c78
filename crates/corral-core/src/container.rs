use crate::id::generate_id;
use crate::lifecycle::{validate_transition, ContainerState};
use crate::store::{ContainerRecord, ContainerStore};
use crate::CoreError;
use corral_layers::{assemble, AssemblyReport, Layer};
use corral_runtime::process::pid_alive;
use corral_runtime::{
    DetachedProcess, ExitOutcome, IsolationProvider, LaunchSpec, ProcessHandle, ProcessIo,
    ResourceGroup, ResourceLimits, StdioMode,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const GRACE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    pub image: Option<String>,
}

impl ContainerConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            limits: ResourceLimits::default(),
            image: None,
        }
    }
}

/// Read-only snapshot returned by `inspect` and `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub state: ContainerState,
    pub rootfs: Option<PathBuf>,
    pub image: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitOutcome>,
}

impl ContainerInfo {
    pub fn command_line(&self) -> String {
        command_line(&self.command, &self.args)
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_owned()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct Status {
    state: ContainerState,
    pid: Option<u32>,
    rootfs: Option<PathBuf>,
    group: Option<ResourceGroup>,
    exit: Option<ExitOutcome>,
    updated_at: String,
}

#[derive(Default)]
struct Supervision {
    process: Option<Box<dyn ProcessHandle>>,
    /// Piped stdio, detached from the handle so a reaped process keeps its
    /// buffered output for a late attach.
    io: Option<ProcessIo>,
}

/// One isolated process and its state machine.
///
/// Two locks: `supervision` serializes start/kill/reap and owns the process
/// handle; `status` holds the observable fields and is only ever held for a
/// copy, so `inspect` never waits behind a slow start. Lock order is
/// supervision, then status.
pub struct Container {
    id: String,
    config: ContainerConfig,
    created_at: String,
    provider: Arc<dyn IsolationProvider>,
    store: ContainerStore,
    status: Mutex<Status>,
    supervision: Mutex<Supervision>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn create(
        config: ContainerConfig,
        provider: Arc<dyn IsolationProvider>,
        store: ContainerStore,
    ) -> Result<Self, CoreError> {
        if config.command.trim().is_empty() {
            return Err(CoreError::Argument("command must not be empty".to_owned()));
        }
        config
            .limits
            .validate()
            .map_err(|e| CoreError::Argument(e.to_string()))?;

        let created_at = now();
        let container = Self {
            id: generate_id(),
            status: Mutex::new(Status {
                state: ContainerState::Created,
                pid: None,
                rootfs: None,
                group: None,
                exit: None,
                updated_at: created_at.clone(),
            }),
            created_at,
            config,
            provider,
            store,
            supervision: Mutex::new(Supervision::default()),
        };
        container.store.put(&container.record())?;
        info!(
            "created container {}: {}",
            container.id,
            container.command_line()
        );
        Ok(container)
    }

    /// Rebuild a container from its on-disk record after a daemon restart.
    /// Processes that are still alive are supervised again; the rest are
    /// marked stopped and their groups released.
    pub fn recover(
        record: ContainerRecord,
        provider: Arc<dyn IsolationProvider>,
        store: ContainerStore,
    ) -> Self {
        let mut state = record.state;
        let mut pid = record.pid;
        let mut group = record.group;
        let mut process: Option<Box<dyn ProcessHandle>> = None;

        if matches!(
            state,
            ContainerState::Starting | ContainerState::Running | ContainerState::Stopping
        ) {
            match pid.filter(|p| still_ours(*p, group.as_ref())) {
                Some(p) => {
                    debug!("container {} still alive as pid {p}", record.id);
                    process = Some(Box::new(DetachedProcess::new(p)));
                    state = ContainerState::Running;
                }
                None => {
                    if let Some(g) = group.take() {
                        provider.release(&g);
                    }
                    pid = None;
                    state = ContainerState::Stopped;
                }
            }
        }

        let container = Self {
            id: record.id,
            config: ContainerConfig {
                command: record.command,
                args: record.args,
                limits: record.limits,
                image: record.image,
            },
            created_at: record.created_at,
            provider,
            store,
            status: Mutex::new(Status {
                state,
                pid,
                rootfs: record.rootfs,
                group,
                exit: record.exit,
                updated_at: now(),
            }),
            supervision: Mutex::new(Supervision { process, io: None }),
        };
        container.persist();
        container
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn command_line(&self) -> String {
        command_line(&self.config.command, &self.config.args)
    }

    pub fn state(&self) -> ContainerState {
        self.status().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.status().pid
    }

    pub fn inspect(&self) -> ContainerInfo {
        let status = self.status();
        ContainerInfo {
            id: self.id.clone(),
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            pid: status.pid,
            state: status.state,
            rootfs: status.rootfs.clone(),
            image: self.config.image.clone(),
            created_at: self.created_at.clone(),
            exit: status.exit,
        }
    }

    /// Assemble `layers` into this container's rootfs. Only valid before
    /// `start`; a failed assembly leaves no partial tree behind.
    pub fn prepare_filesystem(&self, layers: Vec<Layer>) -> Result<AssemblyReport, CoreError> {
        let _supervision = self.supervise();
        let state = self.state();
        if state != ContainerState::Created {
            return Err(CoreError::InvalidState(format!(
                "container {} is {state}; its filesystem can only be prepared before start",
                self.id
            )));
        }

        let dest = self.store.rootfs_path(&self.id);
        remove_tree(&dest)?;
        match assemble(layers, &dest) {
            Ok(report) => {
                {
                    let mut status = self.status();
                    status.rootfs = Some(dest);
                    status.updated_at = now();
                }
                self.persist();
                Ok(report)
            }
            Err(e) => {
                if let Err(cleanup) = remove_tree(&dest) {
                    warn!("failed to remove partial rootfs {}: {cleanup}", dest.display());
                }
                Err(e.into())
            }
        }
    }

    /// Enroll the resource group, then launch the command inside it.
    /// Any failure releases what was acquired and leaves the container
    /// `Failed`.
    pub fn start(&self, stdio: StdioMode) -> Result<u32, CoreError> {
        let mut supervision = self.supervise();
        self.advance(ContainerState::Starting, |_| {})?;

        let group = match self.provider.enroll(&self.id, &self.config.limits) {
            Ok(group) => group,
            Err(e) => {
                self.mark_failed();
                return Err(e.into());
            }
        };

        let spec = LaunchSpec {
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            hostname: self.id.clone(),
            rootfs: self.status().rootfs.clone(),
            stdio,
        };
        let mut process = match self.provider.spawn(&spec, &group) {
            Ok(process) => process,
            Err(e) => {
                self.provider.release(&group);
                self.mark_failed();
                return Err(e.into());
            }
        };

        let pid = process.pid();
        let running = self.advance(ContainerState::Running, |status| {
            status.pid = Some(pid);
            status.group = Some(group.clone());
        });
        if let Err(e) = running {
            let _ = process.kill();
            let _ = process.wait();
            self.provider.release(&group);
            self.mark_failed();
            return Err(e);
        }
        if stdio == StdioMode::Piped {
            supervision.io = process.take_io();
        }
        supervision.process = Some(process);

        info!("container {} running as pid {pid}", self.id);
        Ok(pid)
    }

    /// Stop the container: SIGTERM, up to `grace` to exit, then SIGKILL.
    /// Stopping an already stopped or failed container is a no-op.
    pub fn kill(&self, grace: Duration) -> Result<(), CoreError> {
        let mut supervision = self.supervise();
        match self.state() {
            ContainerState::Stopped | ContainerState::Failed => {
                debug!("container {} already {}", self.id, self.state());
                return Ok(());
            }
            ContainerState::Created => {
                return self.advance(ContainerState::Stopped, |_| {});
            }
            ContainerState::Starting | ContainerState::Running => {
                self.advance(ContainerState::Stopping, |_| {})?;
            }
            ContainerState::Stopping => {}
        }

        let exit = supervision
            .process
            .take()
            .and_then(|mut process| stop_process(process.as_mut(), grace));
        self.release_group();

        self.advance(ContainerState::Stopped, |status| {
            status.pid = None;
            if exit.is_some() {
                status.exit = exit;
            }
        })?;
        info!("container {} stopped", self.id);
        Ok(())
    }

    /// Collect a process that exited on its own. Returns true if this call
    /// moved the container to `Stopped`. Never blocks on an in-flight
    /// start or kill.
    pub fn reap(&self) -> bool {
        let mut supervision = match self.supervision.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if self.state() != ContainerState::Running {
            return false;
        }
        let Some(process) = supervision.process.as_mut() else {
            return false;
        };
        let outcome = match process.try_wait() {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return false,
            Err(e) => {
                warn!("failed to poll container {}: {e}", self.id);
                return false;
            }
        };

        supervision.process = None;
        self.release_group();
        if let Err(e) = self.advance(ContainerState::Stopped, |status| {
            status.pid = None;
            status.exit = Some(outcome);
        }) {
            warn!("container {} exited but could not be marked stopped: {e}", self.id);
            return false;
        }
        info!("container {} exited: {outcome:?}", self.id);
        true
    }

    /// The piped stdin/stdout of a container started with `StdioMode::Piped`.
    pub fn take_io(&self) -> Option<ProcessIo> {
        self.supervise().io.take()
    }

    /// Remove the on-disk record and rootfs. Only for stopped or failed
    /// containers.
    pub fn destroy(&self) -> Result<(), CoreError> {
        let mut supervision = self.supervise();
        let state = self.state();
        if !state.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "container {} is {state}; stop it before removing",
                self.id
            )));
        }
        supervision.io = None;
        self.store.remove(&self.id)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supervise(&self) -> MutexGuard<'_, Supervision> {
        self.supervision
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self) -> ContainerRecord {
        let status = self.status();
        ContainerRecord {
            id: self.id.clone(),
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            image: self.config.image.clone(),
            rootfs: status.rootfs.clone(),
            pid: status.pid,
            state: status.state,
            limits: self.config.limits,
            group: status.group.clone(),
            exit: status.exit,
            created_at: self.created_at.clone(),
            updated_at: status.updated_at.clone(),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.put(&self.record()) {
            warn!("failed to persist container {}: {e}", self.id);
        }
    }

    fn advance(
        &self,
        to: ContainerState,
        update: impl FnOnce(&mut Status),
    ) -> Result<(), CoreError> {
        {
            let mut status = self.status();
            validate_transition(status.state, to)?;
            debug!("container {}: {} -> {to}", self.id, status.state);
            status.state = to;
            status.updated_at = now();
            update(&mut status);
        }
        self.persist();
        Ok(())
    }

    fn mark_failed(&self) {
        if let Err(e) = self.advance(ContainerState::Failed, |status| status.pid = None) {
            warn!("container {} could not be marked failed: {e}", self.id);
        }
    }

    fn release_group(&self) {
        let group = self.status().group.take();
        if let Some(group) = group {
            self.provider.release(&group);
        }
    }
}

fn stop_process(process: &mut dyn ProcessHandle, grace: Duration) -> Option<ExitOutcome> {
    let pid = process.pid();
    if let Err(e) = process.terminate() {
        warn!("failed to send SIGTERM to pid {pid}: {e}");
    }

    let deadline = Instant::now() + grace;
    loop {
        match process.try_wait() {
            Ok(Some(outcome)) => return Some(outcome),
            Ok(None) if Instant::now() < deadline => thread::sleep(GRACE_POLL),
            Ok(None) => break,
            Err(e) => {
                warn!("failed to poll pid {pid}: {e}");
                break;
            }
        }
    }

    warn!("process {pid} did not exit after SIGTERM, sending SIGKILL");
    if let Err(e) = process.kill() {
        warn!("failed to send SIGKILL to pid {pid}: {e}");
    }
    match process.wait() {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("failed to reap pid {pid}: {e}");
            None
        }
    }
}

/// A recorded pid only counts as ours if it is alive and, when we know the
/// group, still a member of it. Guards against pid reuse across restarts.
fn still_ours(pid: u32, group: Option<&ResourceGroup>) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    let Some(group) = group else {
        return true;
    };
    fs::read_to_string(format!("/proc/{pid}/cgroup"))
        .map(|c| c.lines().any(|l| l.ends_with(&format!("/{}", group.name()))))
        .unwrap_or(false)
}

fn remove_tree(path: &std::path::Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_runtime::MockProvider;
    use std::io::Read;

    const GRACE: Duration = Duration::from_millis(200);
    const SIGTERM: i32 = 15;
    const SIGKILL: i32 = 9;

    fn setup() -> (tempfile::TempDir, Arc<MockProvider>, ContainerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContainerStore::new(dir.path());
        (dir, Arc::new(MockProvider::new()), store)
    }

    fn create(provider: &Arc<MockProvider>, store: &ContainerStore) -> Container {
        let config = ContainerConfig::new("echo", vec!["hello".to_owned()]);
        Container::create(config, provider.clone(), store.clone()).unwrap()
    }

    fn tar_layer(ordinal: u32, path: &str, content: &str) -> Layer {
        let mut ar = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        h.set_size(content.len() as u64);
        h.set_mode(0o644);
        ar.append_data(&mut h, path, content.as_bytes()).unwrap();
        Layer::from_bytes(ordinal, ar.into_inner().unwrap())
    }

    #[test]
    fn create_rejects_blank_command() {
        let (_dir, provider, store) = setup();
        let config = ContainerConfig::new("   ", Vec::new());
        assert!(matches!(
            Container::create(config, provider, store),
            Err(CoreError::Argument(_))
        ));
    }

    #[test]
    fn create_rejects_invalid_limits() {
        let (_dir, provider, store) = setup();
        let mut config = ContainerConfig::new("sh", Vec::new());
        config.limits.cpu_period_us = 0;
        assert!(matches!(
            Container::create(config, provider, store),
            Err(CoreError::Argument(_))
        ));
    }

    #[test]
    fn create_persists_record() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        let record = store.get(c.id()).unwrap();
        assert_eq!(record.state, ContainerState::Created);
        assert_eq!(record.command, "echo");
        assert!(c.inspect().rootfs.is_none());
    }

    #[test]
    fn start_runs_and_records_pid() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        let pid = c.start(StdioMode::Null).unwrap();

        assert_eq!(c.state(), ContainerState::Running);
        assert_eq!(c.pid(), Some(pid));
        let record = store.get(c.id()).unwrap();
        assert_eq!(record.pid, Some(pid));
        assert_eq!(record.group.unwrap().name(), c.id());
    }

    #[test]
    fn start_twice_is_rejected() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        assert!(matches!(
            c.start(StdioMode::Null),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert_eq!(provider.spawn_count(), 1);
    }

    #[test]
    fn enroll_failure_marks_failed() {
        let (_dir, provider, store) = setup();
        provider.fail_enroll("cgroup busy");
        let c = create(&provider, &store);
        assert!(matches!(c.start(StdioMode::Null), Err(CoreError::Resource(_))));
        assert_eq!(c.state(), ContainerState::Failed);
        assert_eq!(provider.spawn_count(), 0);
    }

    #[test]
    fn spawn_failure_releases_group() {
        let (_dir, provider, store) = setup();
        provider.fail_spawn("operation not permitted");
        let c = create(&provider, &store);
        assert!(matches!(c.start(StdioMode::Null), Err(CoreError::Namespace(_))));
        assert_eq!(c.state(), ContainerState::Failed);
        assert!(provider.live_groups().is_empty());
        assert_eq!(c.pid(), None);
    }

    #[test]
    fn kill_stops_and_releases_once() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();

        c.kill(GRACE).unwrap();
        c.kill(GRACE).unwrap();

        assert_eq!(c.state(), ContainerState::Stopped);
        assert_eq!(c.pid(), None);
        assert_eq!(provider.release_count(c.id()), 1);
        let process = provider.process(c.id()).unwrap();
        assert_eq!(process.signals(), vec![SIGTERM]);
        assert_eq!(c.inspect().exit, Some(ExitOutcome::Signal(SIGTERM)));
    }

    #[test]
    fn kill_escalates_after_grace() {
        let (_dir, provider, store) = setup();
        provider.ignore_sigterm();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();

        let started = Instant::now();
        c.kill(Duration::from_millis(100)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));

        let process = provider.process(c.id()).unwrap();
        assert_eq!(process.signals(), vec![SIGTERM, SIGKILL]);
        assert_eq!(c.inspect().exit, Some(ExitOutcome::Signal(SIGKILL)));
    }

    #[test]
    fn kill_before_start_stops_without_signal() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.kill(GRACE).unwrap();
        assert_eq!(c.state(), ContainerState::Stopped);
        assert!(provider.calls().is_empty());
        assert!(c.start(StdioMode::Null).is_err());
    }

    #[test]
    fn reap_collects_unexpected_exit() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        assert!(!c.reap());

        provider.process(c.id()).unwrap().exit(ExitOutcome::Code(1));
        assert!(c.reap());
        assert!(!c.reap());

        assert_eq!(c.state(), ContainerState::Stopped);
        assert_eq!(c.inspect().exit, Some(ExitOutcome::Code(1)));
        assert_eq!(provider.release_count(c.id()), 1);

        // a later stop must not release again
        c.kill(GRACE).unwrap();
        assert_eq!(provider.release_count(c.id()), 1);
    }

    #[test]
    fn prepare_filesystem_sets_rootfs() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        let report = c
            .prepare_filesystem(vec![tar_layer(0, "etc/hostname", "box")])
            .unwrap();
        assert_eq!(report.files, 1);

        let rootfs = c.inspect().rootfs.unwrap();
        assert_eq!(rootfs, store.rootfs_path(c.id()));
        assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "box");
        assert_eq!(c.state(), ContainerState::Created);
    }

    #[test]
    fn failed_assembly_leaves_no_rootfs() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        let layers = vec![tar_layer(0, "a", "1"), tar_layer(0, "b", "2")];
        assert!(matches!(
            c.prepare_filesystem(layers),
            Err(CoreError::Filesystem(_))
        ));
        assert!(!store.rootfs_path(c.id()).exists());
        assert_eq!(c.state(), ContainerState::Created);
        assert!(c.inspect().rootfs.is_none());
    }

    #[test]
    fn prepare_after_start_is_rejected() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        assert!(matches!(
            c.prepare_filesystem(Vec::new()),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn attached_start_exposes_io() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Piped).unwrap();
        let mut io = c.take_io().unwrap();
        let mut out = String::new();
        io.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello\n");
        assert!(c.take_io().is_none());
    }

    #[test]
    fn attached_output_survives_early_reap() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Piped).unwrap();

        provider.process(c.id()).unwrap().exit(ExitOutcome::Code(0));
        assert!(c.reap());
        assert_eq!(c.state(), ContainerState::Stopped);

        let mut io = c.take_io().unwrap();
        let mut out = String::new();
        io.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn detached_start_has_no_io() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        assert!(c.take_io().is_none());
    }

    #[test]
    fn destroy_requires_terminal_state() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        assert!(matches!(c.destroy(), Err(CoreError::InvalidState(_))));
        c.kill(GRACE).unwrap();
        c.destroy().unwrap();
        assert!(!store.container_dir(c.id()).exists());
    }

    #[test]
    fn recover_marks_dead_process_stopped() {
        let (_dir, provider, store) = setup();
        let c = create(&provider, &store);
        c.start(StdioMode::Null).unwrap();
        let mut record = store.get(c.id()).unwrap();
        // pid_max on Linux is at most 2^22
        record.pid = Some(4_194_305);

        let recovered = Container::recover(record, provider.clone(), store.clone());
        assert_eq!(recovered.state(), ContainerState::Stopped);
        assert_eq!(recovered.pid(), None);
        assert_eq!(provider.release_count(c.id()), 1);
        assert_eq!(store.get(c.id()).unwrap().state, ContainerState::Stopped);
    }

    #[test]
    fn recover_reattaches_live_process() {
        let (_dir, provider, store) = setup();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let c = create(&provider, &store);
        let mut record = store.get(c.id()).unwrap();
        record.state = ContainerState::Running;
        record.pid = Some(child.id());

        let recovered = Container::recover(record, provider.clone(), store.clone());
        assert_eq!(recovered.state(), ContainerState::Running);
        assert_eq!(recovered.pid(), Some(child.id()));

        let killer = thread::spawn(move || {
            recovered.kill(Duration::from_secs(5)).unwrap();
            recovered
        });
        child.wait().unwrap();
        let recovered = killer.join().unwrap();
        assert_eq!(recovered.state(), ContainerState::Stopped);
        assert_eq!(recovered.inspect().exit, Some(ExitOutcome::Unknown));
    }
}
