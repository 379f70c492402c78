use crate::cgroup::ResourceGroup;
use crate::limits::ResourceLimits;
use crate::process::{ExitOutcome, ProcessHandle, ProcessIo};
use crate::provider::{IsolationProvider, LaunchSpec, StdioMode};
use crate::RuntimeError;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const FIRST_MOCK_PID: u32 = 40_000;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Enroll(String),
    Release(String),
    Spawn { group: String, command: String },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    fail_enroll: Option<String>,
    fail_spawn: Option<String>,
    spawn_delay: Option<Duration>,
    ignore_sigterm: bool,
    next_pid: u32,
    processes: HashMap<String, MockProcess>,
}

/// In-memory provider: no kernel objects, every call recorded.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the calls recorded so far.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next `enroll` calls fail with `message`.
    pub fn fail_enroll(&self, message: &str) {
        self.lock().fail_enroll = Some(message.to_owned());
    }

    /// Make the next `spawn` calls fail with `message`.
    pub fn fail_spawn(&self, message: &str) {
        self.lock().fail_spawn = Some(message.to_owned());
    }

    /// Delay every `spawn` by `delay`.
    pub fn set_spawn_delay(&self, delay: Duration) {
        self.lock().spawn_delay = Some(delay);
    }

    /// Processes spawned afterwards only react to SIGKILL.
    pub fn ignore_sigterm(&self) {
        self.lock().ignore_sigterm = true;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn release_count(&self, group: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Release(g) if g == group))
            .count()
    }

    pub fn spawn_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Spawn { .. }))
            .count()
    }

    /// Groups enrolled and not yet released.
    pub fn live_groups(&self) -> Vec<String> {
        let state = self.lock();
        let mut live: Vec<String> = Vec::new();
        for call in &state.calls {
            match call {
                MockCall::Enroll(g) => live.push(g.clone()),
                MockCall::Release(g) => live.retain(|l| l != g),
                MockCall::Spawn { .. } => {}
            }
        }
        live
    }

    /// The process spawned for `group`, for driving it from a test.
    pub fn process(&self, group: &str) -> Option<MockProcess> {
        self.lock().processes.get(group).cloned()
    }
}

impl IsolationProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enroll(&self, group: &str, limits: &ResourceLimits) -> Result<ResourceGroup, RuntimeError> {
        limits.validate()?;
        let mut state = self.lock();
        if let Some(msg) = &state.fail_enroll {
            return Err(RuntimeError::Resource(msg.clone()));
        }
        state.calls.push(MockCall::Enroll(group.to_owned()));
        Ok(ResourceGroup::new(group, format!("/mock/cgroup/{group}")))
    }

    fn release(&self, group: &ResourceGroup) {
        self.lock()
            .calls
            .push(MockCall::Release(group.name().to_owned()));
    }

    fn spawn(
        &self,
        spec: &LaunchSpec,
        group: &ResourceGroup,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let delay = self.lock().spawn_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(msg) = &state.fail_spawn {
            return Err(RuntimeError::Namespace(msg.clone()));
        }
        state.calls.push(MockCall::Spawn {
            group: group.name().to_owned(),
            command: spec.command.clone(),
        });
        if state.next_pid == 0 {
            state.next_pid = FIRST_MOCK_PID;
        }
        let pid = state.next_pid;
        state.next_pid += 1;

        let output = if spec.stdio == StdioMode::Piped {
            let mut line = spec.args.join(" ");
            line.push('\n');
            Some(line.into_bytes())
        } else {
            None
        };
        let process = MockProcess::new(pid, state.ignore_sigterm, output);
        state
            .processes
            .insert(group.name().to_owned(), process.clone());
        Ok(Box::new(process))
    }
}

#[derive(Default)]
struct ProcState {
    exited: Option<ExitOutcome>,
    signals: Vec<i32>,
    output: Option<Vec<u8>>,
}

/// A fake process. Clones share state, so a test can keep one and make the
/// process "die unexpectedly" while the container owns the other.
///
/// With piped stdio its stdout replays the launch arguments like `echo`.
#[derive(Clone)]
pub struct MockProcess {
    pid: u32,
    ignore_sigterm: bool,
    inner: Arc<(Mutex<ProcState>, Condvar)>,
}

impl MockProcess {
    fn new(pid: u32, ignore_sigterm: bool, output: Option<Vec<u8>>) -> Self {
        let state = ProcState {
            output,
            ..ProcState::default()
        };
        Self {
            pid,
            ignore_sigterm,
            inner: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// End the process with `outcome` as if it had exited on its own.
    pub fn exit(&self, outcome: ExitOutcome) {
        let mut state = self.lock();
        if state.exited.is_none() {
            state.exited = Some(outcome);
        }
        self.inner.1.notify_all();
    }

    pub fn signals(&self) -> Vec<i32> {
        self.lock().signals.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exited.is_some()
    }

    fn signal(&self, sig: i32) {
        self.lock().signals.push(sig);
        if sig == libc::SIGKILL || !self.ignore_sigterm {
            self.exit(ExitOutcome::Signal(sig));
        }
    }
}

impl ProcessHandle for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<(), RuntimeError> {
        self.signal(libc::SIGTERM);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        self.signal(libc::SIGKILL);
        Ok(())
    }

    fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(outcome) = state.exited {
                return Ok(outcome);
            }
            state = cvar
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, RuntimeError> {
        Ok(self.lock().exited)
    }

    fn take_io(&mut self) -> Option<ProcessIo> {
        let output = self.lock().output.take()?;
        Some(ProcessIo {
            stdin: Box::new(io::sink()),
            stdout: Box::new(io::Cursor::new(output)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn spec(stdio: StdioMode) -> LaunchSpec {
        let mut spec = LaunchSpec::new("echo", vec!["hello".to_owned(), "world".to_owned()], "c1");
        spec.stdio = stdio;
        spec
    }

    #[test]
    fn records_calls_in_order() {
        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        provider.release(&group);

        assert_eq!(
            provider.calls(),
            vec![
                MockCall::Enroll("c1".to_owned()),
                MockCall::Spawn {
                    group: "c1".to_owned(),
                    command: "echo".to_owned()
                },
                MockCall::Release("c1".to_owned()),
            ]
        );
        assert!(provider.live_groups().is_empty());
    }

    #[test]
    fn injected_failures() {
        let provider = MockProvider::new();
        provider.fail_enroll("no cgroup for you");
        assert!(matches!(
            provider.enroll("c1", &ResourceLimits::default()),
            Err(RuntimeError::Resource(_))
        ));

        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        provider.fail_spawn("EPERM");
        assert!(provider.spawn(&spec(StdioMode::Null), &group).is_err());
        assert_eq!(provider.live_groups(), vec!["c1".to_owned()]);
    }

    #[test]
    fn terminate_ends_process_unless_ignored() {
        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        let mut handle = provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        handle.terminate().unwrap();
        assert_eq!(handle.wait().unwrap(), ExitOutcome::Signal(libc::SIGTERM));

        provider.ignore_sigterm();
        let group = provider.enroll("c2", &ResourceLimits::default()).unwrap();
        let mut stubborn = provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        stubborn.terminate().unwrap();
        assert_eq!(stubborn.try_wait().unwrap(), None);
        stubborn.kill().unwrap();
        assert_eq!(stubborn.wait().unwrap(), ExitOutcome::Signal(libc::SIGKILL));
    }

    #[test]
    fn process_can_die_unexpectedly() {
        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        let mut handle = provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        assert_eq!(handle.try_wait().unwrap(), None);

        let control = provider.process("c1").unwrap();
        let waiter = thread::spawn(move || handle.wait().unwrap());
        control.exit(ExitOutcome::Code(137));
        assert_eq!(waiter.join().unwrap(), ExitOutcome::Code(137));
    }

    #[test]
    fn piped_stdout_echoes_args() {
        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        let mut handle = provider.spawn(&spec(StdioMode::Piped), &group).unwrap();
        let mut io = handle.take_io().unwrap();
        let mut out = String::new();
        io.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world\n");
        assert!(handle.take_io().is_none());
    }

    #[test]
    fn pids_are_distinct() {
        let provider = MockProvider::new();
        let group = provider.enroll("c1", &ResourceLimits::default()).unwrap();
        let a = provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        let b = provider.spawn(&spec(StdioMode::Null), &group).unwrap();
        assert_ne!(a.pid(), b.pid());
    }
}
