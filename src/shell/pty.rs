//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive for
//! the session lifetime so resize can be performed on it; duplicated handles
//! back the reader and writer tasks.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::adapter::{ExitStatus, PtyEvent, PtyProcess, PtySpawner, SpawnRequest, SpawnedPty};
use crate::error::PtyError;

/// Forced terminal type so full-color applications render correctly.
const TERM: &str = "xterm-256color";
const COLORTERM: &str = "truecolor";

/// Read chunk size for PTY output.
const READ_CHUNK: usize = 4096;

/// How long a killed shell gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How long the exit watcher waits for the reader to drain after the shell
/// exits, while the reader is blocked reading the PTY.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair sized `cols` x `rows`.
pub fn allocate_pty(cols: u16, rows: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(cols, rows), None)?;
    Ok(PtyPair { master, slave })
}

/// Environment for the shell: inherited variables, then the forced terminal
/// type, then caller overrides (caller wins).
pub fn merged_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = inherited.into_iter().collect();
    env.insert("TERM".to_string(), TERM.to_string());
    env.insert("COLORTERM".to_string(), COLORTERM.to_string());
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Spawn a login shell on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal. stdin/stdout/stderr are all connected to the slave fd.
pub fn spawn_shell_pty(
    slave: &OwnedFd,
    shell: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let slave_fd = slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.arg("-l")
        .current_dir(working_dir)
        .env_clear()
        .envs(env)
        .kill_on_drop(true)
        // stdio is redirected to the slave in pre_exec
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            for target in 0..=2 {
                if libc::dup2(slave_fd, target) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), nix::Error> {
    let ws = winsize(cols, rows);
    // SAFETY: TIOCSWINSZ reads a Winsize struct that outlives the call.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Wait for the reader task to finish after the shell exited.
///
/// A reader waiting on the event channel is holding output the session has
/// not consumed yet, so it is never cut off; the wait ends when the channel
/// takes the chunk or closes. A reader idle on the PTY for [`DRAIN_TIMEOUT`]
/// (a background process kept the slave open) is aborted. Returns `false`
/// in that case.
async fn drain_reader(reader: &mut JoinHandle<()>, delivering: &AtomicBool) -> bool {
    loop {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut *reader).await.is_ok() {
            return true;
        }
        if !delivering.load(Ordering::SeqCst) {
            reader.abort();
            return false;
        }
    }
}

/// Spawns login shells on freshly allocated POSIX pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSpawner;

impl PtySpawner for NativeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError> {
        let shell = super::resolve_shell(request.shell.as_deref());
        let spawn_err = |reason: String| PtyError::Spawn {
            shell: shell.clone(),
            reason,
        };

        let cwd = match request.cwd {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| spawn_err(e.to_string()))?,
        };
        let PtyPair { master, slave } =
            allocate_pty(request.cols, request.rows).map_err(|e| spawn_err(e.to_string()))?;
        let inherited = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        let env = merged_env(inherited, &request.env);
        let child =
            spawn_shell_pty(&slave, &shell, &cwd, &env).map_err(|e| spawn_err(e.to_string()))?;
        // The parent must not hold the slave open, or reads never see EOF/EIO.
        drop(slave);

        let pid = child.id();
        info!(
            "Spawned {shell} (pid {pid:?}) in {} at {}x{}",
            cwd.display(),
            request.cols,
            request.rows
        );
        NativePty::start(child, pid, master)
            .map(|(process, events)| SpawnedPty {
                process: Box::new(process),
                events,
            })
            .map_err(|e| spawn_err(e.to_string()))
    }
}

/// A shell running on a native PTY.
pub struct NativePty {
    pid: Option<u32>,
    master: OwnedFd,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    alive: Arc<AtomicBool>,
    /// Set once `kill` ran; the escalation task then owns termination.
    kill_requested: bool,
    /// Writer and reader tasks, aborted on drop. The exit watcher is left
    /// running so the child is always reaped.
    io_tasks: Vec<AbortHandle>,
}

impl NativePty {
    fn start(
        mut child: Child,
        pid: Option<u32>,
        master: OwnedFd,
    ) -> std::io::Result<(Self, mpsc::Receiver<PtyEvent>)> {
        let master_write = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
        let master_read = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));

        let (events_tx, events_rx) = mpsc::channel::<PtyEvent>(64);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_tx = events_tx.clone();
        let delivering = Arc::new(AtomicBool::new(false));
        let reader_delivering = Arc::clone(&delivering);
        let mut reader = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut tmp).await {
                    // EIO once the slave side is gone
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        reader_delivering.store(true, Ordering::SeqCst);
                        let sent = reader_tx.send(PtyEvent::Data(tmp[..n].to_vec())).await;
                        reader_delivering.store(false, Ordering::SeqCst);
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let io_tasks = vec![writer.abort_handle(), reader.abort_handle()];

        let alive_exit = Arc::clone(&alive);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(s) => ExitStatus {
                    code: s.code(),
                    signal: s.signal(),
                },
                Err(e) => {
                    warn!("Shell pid {pid:?} wait error: {e}");
                    ExitStatus {
                        code: None,
                        signal: None,
                    }
                }
            };
            alive_exit.store(false, Ordering::SeqCst);
            if !drain_reader(&mut reader, &delivering).await {
                debug!("Shell pid {pid:?} output still open after exit, detaching reader");
            }
            info!("Shell pid {pid:?} exited ({status})");
            let _ = events_tx.send(PtyEvent::Exit(status)).await;
        });

        Ok((
            Self {
                pid,
                master,
                input_tx,
                alive,
                kill_requested: false,
                io_tasks,
            },
            events_rx,
        ))
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else { return };
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, signal) {
            debug!("killpg({pgid}, {signal}) failed: {e}");
        }
    }
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| PtyError::InputClosed)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        resize_pty(&self.master, cols, rows).map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn kill(&mut self, signal: Signal) {
        self.kill_requested = true;
        self.signal_group(signal);
        if signal == Signal::SIGKILL {
            return;
        }
        let Some(pid) = self.pid else { return };
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            if alive.load(Ordering::SeqCst) {
                warn!("Shell pid {pid} ignored {signal}, sending SIGKILL");
                #[allow(clippy::cast_possible_wrap)]
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.is_alive() && !self.kill_requested {
            self.signal_group(Signal::SIGKILL);
        }
        for task in &self.io_tasks {
            task.abort();
        }
    }
}
