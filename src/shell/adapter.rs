//! Lifecycle contract around a pseudo-terminal backed shell.
//!
//! The session router never touches PTY file descriptors directly. It owns a
//! [`PtyAdapter`], which enforces the lifecycle rules:
//!
//! - nothing happens before `spawn`; every other operation returns
//!   [`PtyError::NotSpawned`] (no implicit spawn)
//! - `spawn` succeeds at most once per adapter
//! - `resize` failures are logged and swallowed
//! - `kill` is idempotent and never signals a process that already exited
//!
//! Shell output and exit are delivered as [`PtyEvent`]s on a channel rather
//! than through callbacks, so the connection task can `select!` on them next
//! to transport frames and timers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::PtyError;

/// Parameters for starting a shell.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Explicit shell binary; resolved from the user database when `None`.
    pub shell: Option<String>,
    /// Working directory; the server's CWD when `None`.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Overrides layered over the inherited environment (caller wins).
    pub env: HashMap<String, String>,
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Asynchronous output of a running shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY master, in stream order.
    Data(Vec<u8>),
    /// The shell exited. Sent after the last `Data` chunk the reader saw.
    Exit(ExitStatus),
}

/// A running shell attached to a pseudo-terminal.
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Queue bytes for the shell's input. Order is preserved.
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    /// Deliver `signal` to the shell's process group.
    fn kill(&mut self, signal: Signal);
    fn is_alive(&self) -> bool;
}

/// A spawned process plus the receiving end of its event stream.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub events: mpsc::Receiver<PtyEvent>,
}

/// Starts shells on pseudo-terminals. The native implementation is
/// [`crate::shell::pty::NativeSpawner`].
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError>;
}

/// Per-session owner of at most one shell process.
pub struct PtyAdapter {
    spawner: Arc<dyn PtySpawner>,
    process: Option<Box<dyn PtyProcess>>,
    events: Option<mpsc::Receiver<PtyEvent>>,
    killed: bool,
}

impl PtyAdapter {
    pub fn new(spawner: Arc<dyn PtySpawner>) -> Self {
        Self {
            spawner,
            process: None,
            events: None,
            killed: false,
        }
    }

    /// Start the shell. Returns its pid when known.
    pub fn spawn(&mut self, request: &SpawnRequest) -> Result<Option<u32>, PtyError> {
        if self.process.is_some() {
            return Err(PtyError::AlreadySpawned);
        }
        let SpawnedPty { process, events } = self.spawner.spawn(request)?;
        let pid = process.pid();
        self.process = Some(process);
        self.events = Some(events);
        Ok(pid)
    }

    /// Hand over the output/exit event stream. Can be taken once.
    pub fn take_events(&mut self) -> Result<mpsc::Receiver<PtyEvent>, PtyError> {
        if self.process.is_none() {
            return Err(PtyError::NotSpawned);
        }
        self.events.take().ok_or(PtyError::AlreadySubscribed)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.running()?.write(data)
    }

    /// Best-effort resize. Only `NotSpawned` is reported to the caller.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if let Err(e) = self.running()?.resize(cols, rows) {
            warn!("Resize to {cols}x{rows} failed: {e}");
        }
        Ok(())
    }

    /// Terminate the shell. SIGHUP unless another signal is given.
    ///
    /// Idempotent: only the first call on a live process signals it.
    pub fn kill(&mut self, signal: Option<Signal>) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if self.killed {
            return;
        }
        self.killed = true;
        if process.is_alive() {
            process.kill(signal.unwrap_or(Signal::SIGHUP));
        } else {
            debug!("Shell already exited, nothing to kill");
        }
    }

    pub fn is_alive(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn is_spawned(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    fn running(&self) -> Result<&dyn PtyProcess, PtyError> {
        self.process.as_deref().ok_or(PtyError::NotSpawned)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory terminal used by router tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared record of everything the fake terminals were asked to do.
    #[derive(Default)]
    pub struct FakeLog {
        pub spawns: AtomicUsize,
        pub kills: AtomicUsize,
        pub fail_spawn: AtomicBool,
        pub fail_resize: AtomicBool,
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub resizes: Mutex<Vec<(u16, u16)>>,
        pub requests: Mutex<Vec<SpawnRequest>>,
        /// Sender side of the most recent spawn's event stream.
        pub events: Mutex<Option<mpsc::Sender<PtyEvent>>>,
        pub alive: Arc<AtomicBool>,
    }

    impl FakeLog {
        pub fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub fn kills(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        pub fn event_sender(&self) -> mpsc::Sender<PtyEvent> {
            self.events.lock().unwrap().clone().expect("not spawned")
        }
    }

    pub struct FakeSpawner {
        pub log: Arc<FakeLog>,
    }

    impl FakeSpawner {
        pub fn new() -> (Arc<Self>, Arc<FakeLog>) {
            let log = Arc::new(FakeLog::default());
            (Arc::new(Self { log: Arc::clone(&log) }), log)
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError> {
            if self.log.fail_spawn.load(Ordering::SeqCst) {
                return Err(PtyError::Spawn {
                    shell: "/fake/sh".into(),
                    reason: "no such file".into(),
                });
            }
            self.log.spawns.fetch_add(1, Ordering::SeqCst);
            self.log.requests.lock().unwrap().push(request.clone());
            self.log.alive.store(true, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            *self.log.events.lock().unwrap() = Some(tx);
            Ok(SpawnedPty {
                process: Box::new(FakeProcess {
                    log: Arc::clone(&self.log),
                }),
                events: rx,
            })
        }
    }

    struct FakeProcess {
        log: Arc<FakeLog>,
    }

    impl PtyProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn write(&self, data: &[u8]) -> Result<(), PtyError> {
            self.log.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
            if self.log.fail_resize.load(Ordering::SeqCst) {
                return Err(PtyError::Resize("ENOTTY".into()));
            }
            self.log.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        fn kill(&mut self, _signal: Signal) {
            self.log.kills.fetch_add(1, Ordering::SeqCst);
            self.log.alive.store(false, Ordering::SeqCst);
        }

        fn is_alive(&self) -> bool {
            self.log.alive.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeSpawner;
    use super::*;

    fn request() -> SpawnRequest {
        SpawnRequest {
            cols: 80,
            rows: 24,
            ..SpawnRequest::default()
        }
    }

    #[test]
    fn test_operations_before_spawn_fail() {
        let (spawner, log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        assert!(matches!(adapter.write(b"ls\n"), Err(PtyError::NotSpawned)));
        assert!(matches!(adapter.resize(100, 30), Err(PtyError::NotSpawned)));
        assert!(matches!(adapter.take_events(), Err(PtyError::NotSpawned)));
        assert!(!adapter.is_alive());
        adapter.kill(None);
        assert_eq!(log.spawns(), 0);
        assert_eq!(log.kills(), 0);
    }

    #[test]
    fn test_spawn_only_once() {
        let (spawner, log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        assert!(!adapter.is_spawned());
        assert_eq!(adapter.spawn(&request()).unwrap(), Some(4242));
        assert!(adapter.is_spawned());
        assert!(matches!(
            adapter.spawn(&request()),
            Err(PtyError::AlreadySpawned)
        ));
        assert_eq!(log.spawns(), 1);
    }

    #[test]
    fn test_events_taken_once() {
        let (spawner, _log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        adapter.spawn(&request()).unwrap();
        assert!(adapter.take_events().is_ok());
        assert!(matches!(
            adapter.take_events(),
            Err(PtyError::AlreadySubscribed)
        ));
    }

    #[test]
    fn test_resize_failure_is_swallowed() {
        let (spawner, log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        adapter.spawn(&request()).unwrap();
        log.fail_resize.store(true, Ordering::SeqCst);
        assert!(adapter.resize(120, 40).is_ok());
    }

    #[test]
    fn test_kill_is_idempotent() {
        let (spawner, log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        adapter.spawn(&request()).unwrap();
        assert!(adapter.is_alive());
        adapter.kill(None);
        adapter.kill(None);
        adapter.kill(Some(Signal::SIGKILL));
        assert_eq!(log.kills(), 1);
        assert!(!adapter.is_alive());
    }

    #[test]
    fn test_kill_after_exit_is_noop() {
        let (spawner, log) = FakeSpawner::new();
        let mut adapter = PtyAdapter::new(spawner);
        adapter.spawn(&request()).unwrap();
        log.alive.store(false, Ordering::SeqCst);
        adapter.kill(None);
        assert_eq!(log.kills(), 0);
    }
}
