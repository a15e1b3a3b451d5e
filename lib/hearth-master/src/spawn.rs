//! Worker process spawning.
//!
//! Workers are spawned by executing a [`WorkerCommand`], by default the current executable with the same arguments as
//! the master, with the worker's identity in its environment and one end of a socket pair at descriptor
//! [`IPC_FD`]. Each spawned process gets a task that forwards the messages it sends and reports its exit, both through
//! the same channel, so that every message a worker sent before exiting is delivered before its exit.

use std::{
    ffi::OsString,
    io,
    os::{
        fd::{AsRawFd as _, RawFd},
        unix::{net::UnixStream as StdUnixStream, process::ExitStatusExt as _},
    },
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use hearth_core::{
    ipc::{decode_message, IPC_FD, IPC_FD_ENV, WORKER_INDEX_ENV, WORKER_NAME_ENV},
    message::{Message, Pid},
};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    net::UnixStream,
    process::{Child, Command},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, warn};

/// Time allowed for a worker's remaining messages to be read after it exits.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The program executed to start a worker process.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Creates a new `WorkerCommand` running the given program with the given arguments.
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a `WorkerCommand` re-executing the current program with the arguments it was started with.
    ///
    /// # Errors
    ///
    /// If the path of the current executable cannot be determined, an error is returned.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

/// How a worker process exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExit {
    /// The process exited with the given code.
    Code(i32),

    /// The process was terminated by the given signal.
    Signal(i32),

    /// The exit status of the process could not be determined.
    Unknown,
}

impl ProcessExit {
    fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => Self::Code(code),
                (None, Some(signal)) => Self::Signal(signal),
                (None, None) => Self::Unknown,
            },
            Err(e) => {
                warn!(error = %e, "Failed to wait for worker process.");
                Self::Unknown
            }
        }
    }
}

/// An event about a spawned worker process.
#[derive(Debug)]
pub enum ProcessEvent {
    /// The process sent a message.
    Message(Message),

    /// The process exited.
    Exited {
        /// Process identifier.
        pid: Pid,

        /// How the process exited.
        exit: ProcessExit,
    },
}

/// Spawns a worker process for the given pool slot.
///
/// Messages sent by the worker, followed by its exit, are delivered to `events`. Returns the process identifier of the
/// worker.
///
/// # Errors
///
/// If the socket pair cannot be created, or the process cannot be spawned, an error is returned.
pub fn spawn_worker(
    command: &WorkerCommand, name: &str, index: usize, events: mpsc::UnboundedSender<ProcessEvent>,
) -> io::Result<Pid> {
    let (master_end, worker_end) = StdUnixStream::pair()?;
    let worker_fd = worker_end.as_raw_fd();

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env(WORKER_NAME_ENV, name)
        .env(WORKER_INDEX_ENV, index.to_string())
        .env(IPC_FD_ENV, IPC_FD.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: Only async-signal-safe functions are called between fork and exec.
    unsafe {
        cmd.pre_exec(move || install_ipc_descriptor(worker_fd));
    }

    let child = cmd.spawn()?;
    drop(worker_end);

    let pid = child.id().ok_or_else(|| io::Error::other("worker process exited before it could be tracked"))?;

    master_end.set_nonblocking(true)?;
    let stream = UnixStream::from_std(master_end)?;
    tokio::spawn(watch_worker(pid, child, stream, events));

    debug!(worker_name = name, worker_index = index, pid, "Spawned worker process.");
    Ok(pid)
}

fn install_ipc_descriptor(fd: RawFd) -> io::Result<()> {
    if fd == IPC_FD {
        // Already in place, but still marked close-on-exec.
        // SAFETY: `fd` is a valid descriptor owned by this process.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    // SAFETY: `fd` is a valid descriptor, and `dup2` clears close-on-exec on the new descriptor.
    if unsafe { libc::dup2(fd, IPC_FD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

async fn watch_worker(pid: Pid, mut child: Child, stream: UnixStream, events: mpsc::UnboundedSender<ProcessEvent>) {
    let reader = tokio::spawn(forward_messages(pid, stream, events.clone()));
    let exit = ProcessExit::from_status(child.wait().await);

    if timeout(EXIT_DRAIN_TIMEOUT, reader).await.is_err() {
        debug!(pid, "IPC channel still open after worker exited.");
    }

    let _ = events.send(ProcessEvent::Exited { pid, exit });
}

async fn forward_messages(pid: Pid, stream: UnixStream, events: mpsc::UnboundedSender<ProcessEvent>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match decode_message(&line) {
                Ok(message) if message.pid() != pid => {
                    warn!(pid, claimed_pid = message.pid(), "Dropping message claiming another process identifier.");
                }
                Ok(message) => {
                    let terminal = message.is_terminal();
                    if events.send(ProcessEvent::Message(message)).is_err() || terminal {
                        break;
                    }
                }
                Err(e) => warn!(pid, error = %e, "Dropping malformed message from worker."),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "Failed to read from worker IPC channel.");
                break;
            }
        }
    }
}
