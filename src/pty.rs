//! PTY (pseudo-terminal) management for spawning and communicating with agents.
//!
//! Provides a clean interface for:
//! - Creating a PTY and spawning a child process in a working directory
//! - Reading output from the child and reporting its exit
//! - Writing input to the child through the injector
//! - Terminating the child (SIGTERM, then SIGKILL)

use crate::error::SessionError;
use crate::inject::Injector;
use crate::protocol::{AgentCommand, ControlKey, ExitInfo};
use crate::session::{ProcessSession, SessionEventSink, SessionSpawner, SpawnRequest};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execv, fork, read, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long a child gets between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Cursor position query some CLIs block on until the terminal answers
const CURSOR_QUERY: &str = "\x1b[6n";
const CURSOR_QUERY_PRIVATE: &str = "\x1b[?6n";
const CURSOR_REPLY: &[u8] = b"\x1b[1;1R";

/// A freshly spawned child attached to a PTY
pub struct Pty {
    /// Master file descriptor, shared with the reader and writer threads
    master_fd: Arc<OwnedFd>,
    /// Child process ID (also its process group, via setsid)
    child_pid: Pid,
}

impl Pty {
    /// Create a new PTY and spawn the requested command in it.
    ///
    /// Everything that can fail is checked before forking, so an error
    /// leaves no process or descriptor behind.
    pub fn spawn(request: &SpawnRequest) -> Result<Self, SessionError> {
        let command = request.command.as_str();
        if command.is_empty() {
            return Err(SessionError::spawn(command, "command cannot be empty"));
        }

        let program = resolve_command(command)
            .ok_or_else(|| SessionError::spawn(command, "command not found"))?;

        let workdir = match &request.workdir {
            Some(dir) if !dir.is_dir() => {
                return Err(SessionError::spawn(
                    command,
                    format!("working directory {} does not exist", dir.display()),
                ))
            }
            Some(dir) => Some(path_cstring(command, dir)?),
            None => None,
        };

        let program_c = path_cstring(command, &program)?;
        let argv = std::iter::once(command)
            .chain(request.args.iter().map(String::as_str))
            .map(|arg| {
                CString::new(arg).map_err(|_| SessionError::spawn(command, "argument contains NUL"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let winsize = Winsize {
            ws_row: request.rows,
            ws_col: request.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // Open PTY pair
        let OpenptyResult { master, slave } =
            openpty(&winsize, None).map_err(|e| SessionError::spawn(command, e))?;

        // Fork
        match unsafe { fork() }.map_err(|e| SessionError::spawn(command, e))? {
            ForkResult::Parent { child } => {
                // Close slave in parent
                drop(slave);

                // Set master to non-blocking
                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| SessionError::spawn(command, e))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| SessionError::spawn(command, e))?;

                info!("Spawned {} with PID {}", command, child);

                Ok(Self {
                    master_fd: Arc::new(master),
                    child_pid: child,
                })
            }
            ForkResult::Child => {
                // Close master in child
                drop(master);

                // Create new session
                setsid().ok();

                // Set controlling terminal
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                // Redirect stdin/stdout/stderr to slave
                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();

                // Close original slave fd if it's not 0, 1, or 2
                if slave_raw > 2 {
                    drop(slave);
                }

                if let Some(dir) = &workdir {
                    if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
                        unsafe { libc::_exit(127) };
                    }
                }

                let _ = execv(&program_c, &argv);
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// Get the child process ID
    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }
}

/// Resolve a command the way `execvp` would, without forking
fn resolve_command(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn path_cstring(command: &str, path: &Path) -> Result<CString, SessionError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SessionError::spawn(command, "path contains NUL"))
}

/// Spawns agents into real pseudo-terminals
pub struct PtySpawner {
    submit_delay: Duration,
}

impl PtySpawner {
    pub fn new(submit_delay: Duration) -> Self {
        Self { submit_delay }
    }
}

impl SessionSpawner for PtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        sink: SessionEventSink,
    ) -> Result<Box<dyn ProcessSession>, SessionError> {
        let pty = Pty::spawn(request)?;
        Ok(Box::new(PtySession::start(pty, sink, self.submit_delay)))
    }
}

/// Running PTY session
///
/// A reader thread streams output to the sink and reaps the child; a writer
/// thread drains the injector's byte channel. Both are blocking threads since
/// PTY operations need polling even in non-blocking mode.
pub struct PtySession {
    agent_id: String,
    child_pid: Pid,
    /// Cleared once the child has been reaped
    running: Arc<AtomicBool>,
    /// Filled in just before `running` is cleared
    exit: Arc<Mutex<Option<ExitInfo>>>,
    /// Set by the first kill request
    kill_requested: Arc<AtomicBool>,
    /// Commands for the injector task
    input_tx: mpsc::UnboundedSender<AgentCommand>,
}

impl PtySession {
    /// Start I/O threads and the injector for a spawned PTY.
    /// Must be called from within a tokio runtime.
    pub fn start(pty: Pty, sink: SessionEventSink, submit_delay: Duration) -> Self {
        let agent_id = sink.key().agent_id.clone();
        let running = Arc::new(AtomicBool::new(true));
        let exit = Arc::new(Mutex::new(None));
        let child_pid = pty.child_pid();

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        // Spawn reader thread (not async task, since PTY is sync)
        let reader_fd = Arc::clone(&pty.master_fd);
        let reader_running = Arc::clone(&running);
        let reader_exit = Arc::clone(&exit);
        let reply_tx = write_tx.clone();
        std::thread::spawn(move || {
            Self::reader_thread(reader_fd, child_pid, reader_running, reader_exit, reply_tx, sink);
        });

        // Spawn writer thread
        let writer_fd = Arc::clone(&pty.master_fd);
        let writer_running = Arc::clone(&running);
        std::thread::spawn(move || {
            Self::writer_thread(writer_fd, writer_running, write_rx);
        });

        tokio::spawn(Injector::new(agent_id.clone(), write_tx, submit_delay).run(input_rx));

        Self {
            agent_id,
            child_pid,
            running,
            exit,
            kill_requested: Arc::new(AtomicBool::new(false)),
            input_tx,
        }
    }

    fn reader_thread(
        fd: Arc<OwnedFd>,
        pid: Pid,
        running: Arc<AtomicBool>,
        exit_slot: Arc<Mutex<Option<ExitInfo>>>,
        reply_tx: mpsc::Sender<Vec<u8>>,
        sink: SessionEventSink,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            match read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    // EOF
                    break;
                }
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    let text = String::from_utf8_lossy(&data);
                    if text.contains(CURSOR_QUERY) || text.contains(CURSOR_QUERY_PRIVATE) {
                        debug!("Detected cursor position query (CSI 6n), sending response");
                        let _ = reply_tx.blocking_send(CURSOR_REPLY.to_vec());
                    }
                    if !sink.output(data) {
                        debug!("Output sink closed");
                        break;
                    }
                }
                Err(Errno::EAGAIN) => {
                    // No data available, wait a bit
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(Errno::EIO) => {
                    // Child closed the terminal
                    break;
                }
                Err(e) => {
                    error!("PTY read error: {}", e);
                    break;
                }
            }
        }

        let exit = wait_for_exit(pid);
        if let Ok(mut slot) = exit_slot.lock() {
            *slot = Some(exit);
        }
        running.store(false, Ordering::SeqCst);
        info!(
            "Child {} exited (code {:?}, signal {:?})",
            pid, exit.code, exit.signal
        );
        sink.exited(exit);
        debug!("Reader thread exiting");
    }

    fn writer_thread(fd: Arc<OwnedFd>, running: Arc<AtomicBool>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = rx.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let mut written = 0;
            while written < data.len() {
                match write(fd.as_fd(), &data[written..]) {
                    Ok(n) => {
                        written += n;
                    }
                    Err(Errno::EAGAIN) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!("PTY write error: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("Writer thread exiting");
    }

    fn submit(&self, command: AgentCommand) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::SessionInactive(self.agent_id.clone()));
        }
        self.input_tx
            .send(command)
            .map_err(|_| SessionError::SessionInactive(self.agent_id.clone()))
    }
}

impl ProcessSession for PtySession {
    fn write_text(&self, text: &str) -> Result<(), SessionError> {
        self.submit(AgentCommand::Text(text.to_string()))
    }

    fn write_control(&self, key: ControlKey) -> Result<(), SessionError> {
        self.submit(AgentCommand::Control(key))
    }

    fn kill(&self) {
        if !self.is_running() || self.kill_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Terminating {} (PID {})", self.agent_id, self.child_pid);
        signal_group(self.child_pid, Signal::SIGTERM);

        let pid = self.child_pid;
        let running = Arc::clone(&self.running);
        std::thread::spawn(move || {
            std::thread::sleep(KILL_GRACE);
            if running.load(Ordering::SeqCst) {
                warn!("PID {} ignored SIGTERM, sending SIGKILL", pid);
                signal_group(pid, Signal::SIGKILL);
            }
        });
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().ok().and_then(|slot| *slot)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Signal the child's process group, falling back to the child alone
fn signal_group(pid: Pid, sig: Signal) {
    if signal::killpg(pid, sig).is_err() {
        let _ = signal::kill(pid, sig);
    }
}

/// Block until the child is reaped
fn wait_for_exit(pid: Pid) -> ExitInfo {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return ExitInfo {
                    code: Some(code),
                    signal: None,
                }
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return ExitInfo {
                    code: None,
                    signal: Some(sig as i32),
                }
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed for {}: {}", pid, e);
                return ExitInfo::default();
            }
        }
    }
}
