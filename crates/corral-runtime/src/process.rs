use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::Duration;
use tracing::debug;

const DETACHED_POLL: Duration = Duration::from_millis(50);

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
    /// The process was not our child; its status was collected elsewhere.
    Unknown,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(sig)) => Self::Signal(sig),
            (None, None) => Self::Unknown,
        }
    }
}

/// Piped standard streams of an attached container.
pub struct ProcessIo {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo").finish_non_exhaustive()
    }
}

/// A running container init process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&mut self) -> Result<(), RuntimeError>;

    /// Force the process to exit (SIGKILL).
    fn kill(&mut self) -> Result<(), RuntimeError>;

    fn wait(&mut self) -> Result<ExitOutcome, RuntimeError>;

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, RuntimeError>;

    /// Hand out the piped stdio once. `None` if not piped or already taken.
    fn take_io(&mut self) -> Option<ProcessIo>;
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: u32, signal: i32) -> Result<(), RuntimeError> {
    let pid_i32 = i32::try_from(pid)
        .map_err(|_| RuntimeError::Exec(format!("invalid pid {pid}: exceeds i32 range")))?;
    if pid_i32 <= 0 {
        return Err(RuntimeError::Exec(format!("refusing to signal pid {pid}")));
    }
    // SAFETY: kill() with a positive pid and a valid signal number has no
    // memory-safety preconditions; pid validated above.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid_i32, signal) };
    if ret != 0 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            debug!("pid {pid} already exited before signal {signal}");
        } else {
            return Err(RuntimeError::Exec(format!(
                "failed to send signal {signal} to pid {pid}: {errno}"
            )));
        }
    }
    Ok(())
}

/// Pids from a whitespace separated listing such as `cgroup.procs` or
/// `/proc/<pid>/task/<tid>/children`. Zero (a pid outside our namespace) is
/// dropped.
pub fn parse_pids(listing: &str) -> Vec<u32> {
    listing
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .filter(|p| *p > 0)
        .collect()
}

/// Direct children of `pid`, oldest first.
pub fn child_pids(pid: u32) -> io::Result<Vec<u32>> {
    fs::read_to_string(format!("/proc/{pid}/task/{pid}/children")).map(|c| parse_pids(&c))
}

/// True while `/proc/<pid>` names a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3, after the parenthesised command name which may hold spaces.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    !matches!(state, None | Some('Z' | 'X'))
}

/// A process spawned by this daemon.
pub struct ChildProcess {
    child: Child,
    exited: Option<ExitOutcome>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: None,
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<(), RuntimeError> {
        if self.exited.is_some() {
            return Ok(());
        }
        send_signal(self.child.id(), libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        if self.exited.is_some() {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(RuntimeError::Exec(format!(
                "failed to kill pid {}: {e}",
                self.child.id()
            ))),
        }
    }

    fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        if let Some(outcome) = self.exited {
            return Ok(outcome);
        }
        let outcome = ExitOutcome::from(self.child.wait()?);
        self.exited = Some(outcome);
        Ok(outcome)
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, RuntimeError> {
        if self.exited.is_some() {
            return Ok(self.exited);
        }
        let outcome = self.child.try_wait()?.map(ExitOutcome::from);
        self.exited = outcome;
        Ok(outcome)
    }

    fn take_io(&mut self) -> Option<ProcessIo> {
        let stdin = self.child.stdin.take()?;
        let Some(stdout) = self.child.stdout.take() else {
            self.child.stdin = Some(stdin);
            return None;
        };
        Some(ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

/// A process recovered after a daemon restart. We can signal it but are not
/// its parent, so exit is observed by polling `/proc`.
#[derive(Debug)]
pub struct DetachedProcess {
    pid: u32,
}

impl DetachedProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessHandle for DetachedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<(), RuntimeError> {
        send_signal(self.pid, libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        send_signal(self.pid, libc::SIGKILL)
    }

    fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        while pid_alive(self.pid) {
            thread::sleep(DETACHED_POLL);
        }
        Ok(ExitOutcome::Unknown)
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, RuntimeError> {
        if pid_alive(self.pid) {
            Ok(None)
        } else {
            Ok(Some(ExitOutcome::Unknown))
        }
    }

    fn take_io(&mut self) -> Option<ProcessIo> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn exit_code_is_reported() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut handle = ChildProcess::new(child);
        assert_eq!(handle.wait().unwrap(), ExitOutcome::Code(3));
        // cached after the first wait
        assert_eq!(handle.try_wait().unwrap(), Some(ExitOutcome::Code(3)));
    }

    #[test]
    fn terminate_delivers_sigterm() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = ChildProcess::new(child);
        handle.terminate().unwrap();
        assert_eq!(handle.wait().unwrap(), ExitOutcome::Signal(libc::SIGTERM));
    }

    #[test]
    fn kill_after_exit_is_ok() {
        let child = Command::new("true").spawn().unwrap();
        let mut handle = ChildProcess::new(child);
        handle.wait().unwrap();
        handle.kill().unwrap();
        handle.terminate().unwrap();
    }

    #[test]
    fn piped_io_round_trips_once() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut handle = ChildProcess::new(child);
        let mut io = handle.take_io().unwrap();
        assert!(handle.take_io().is_none());

        io.stdin.write_all(b"ping").unwrap();
        drop(io.stdin);
        let mut out = String::new();
        io.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
        assert_eq!(handle.wait().unwrap(), ExitOutcome::Code(0));
    }

    #[test]
    fn inherited_stdio_has_no_io() {
        let child = Command::new("true").spawn().unwrap();
        let mut handle = ChildProcess::new(child);
        assert!(handle.take_io().is_none());
        handle.wait().unwrap();
    }

    #[test]
    fn pid_listings_parse() {
        assert_eq!(parse_pids("12 345 \n"), vec![12, 345]);
        assert_eq!(parse_pids("7\n8\n"), vec![7, 8]);
        assert_eq!(parse_pids("0\n9\ngarbage\n"), vec![9]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn detached_process_observes_exit() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut detached = DetachedProcess::new(child.id());
        assert_eq!(detached.try_wait().unwrap(), None);

        detached.kill().unwrap();
        // We are the real parent here; reap so the pid disappears.
        child.wait().unwrap();
        assert_eq!(detached.wait().unwrap(), ExitOutcome::Unknown);
        // Signalling a vanished pid is tolerated.
        detached.terminate().unwrap();
    }

    #[test]
    fn signalling_pid_zero_is_refused() {
        assert!(send_signal(0, libc::SIGTERM).is_err());
    }
}
