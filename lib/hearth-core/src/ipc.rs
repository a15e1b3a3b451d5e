//! Worker-to-master message transport.
//!
//! Workers report to the master over a Unix socket that the master hands to each worker as a well-known file
//! descriptor. Messages are encoded as newline-delimited JSON. Publishing never blocks the event loop: messages are
//! queued to a dedicated writer thread, which owns the socket and performs the actual writes.

use std::{
    io::Write as _,
    net::Shutdown,
    os::{
        fd::{FromRawFd as _, RawFd},
        unix::net::UnixStream,
    },
    sync::mpsc as std_mpsc,
    thread::JoinHandle,
};

use snafu::{ResultExt as _, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::Message;

/// Environment variable carrying the name of the worker group a worker process belongs to.
pub const WORKER_NAME_ENV: &str = "HEARTH_WORKER_NAME";

/// Environment variable carrying the index of a worker process within its group.
pub const WORKER_INDEX_ENV: &str = "HEARTH_WORKER_INDEX";

/// Environment variable carrying the file descriptor of the IPC socket.
pub const IPC_FD_ENV: &str = "HEARTH_IPC_FD";

/// File descriptor the master places the IPC socket at in every worker process.
pub const IPC_FD: RawFd = 3;

/// IPC errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum IpcError {
    /// The IPC descriptor environment variable is not set.
    #[snafu(display("Environment variable '{}' is not set; not running under a master process.", var))]
    MissingDescriptor {
        /// Name of the environment variable.
        var: &'static str,
    },

    /// The IPC descriptor is not a valid, open file descriptor.
    #[snafu(display("Invalid IPC file descriptor '{}'.", value))]
    InvalidDescriptor {
        /// Raw value of the descriptor.
        value: String,
    },

    /// A message could not be encoded.
    #[snafu(display("Failed to encode '{}' message: {}", kind, source))]
    Encode {
        /// Kind of the message.
        kind: &'static str,

        /// Underlying serialization error.
        source: serde_json::Error,
    },

    /// A line received from a worker could not be decoded into a message.
    #[snafu(display("Failed to decode message '{}': {}", line, source))]
    Decode {
        /// Line that failed to decode.
        line: String,

        /// Underlying deserialization error.
        source: serde_json::Error,
    },

    /// The writer thread could not be spawned.
    #[snafu(display("Failed to spawn IPC writer thread: {}", source))]
    SpawnWriter {
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Encodes a message as a single newline-terminated line.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, IpcError> {
    let mut buf = serde_json::to_vec(message).context(Encode { kind: message.kind() })?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decodes a single line into a message.
///
/// Trailing whitespace, including the line terminator, is ignored.
pub fn decode_message(line: &str) -> Result<Message, IpcError> {
    let line = line.trim_end();
    serde_json::from_str(line).context(Decode { line })
}

/// The sending side of the worker-to-master channel.
pub trait Publisher {
    /// Publishes a message to the master.
    ///
    /// This is fire-and-forget: it must never block the caller, and delivery failures are not reported back.
    fn publish(&self, message: Message);

    /// Closes the publisher, flushing any queued messages first.
    fn close(self: Box<Self>) {}
}

/// A publisher backed by an in-process channel.
///
/// Used when the master lives in the same process as the worker, and in tests.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelPublisher {
    /// Creates a new `ChannelPublisher` and the receiver for the messages it publishes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Message receiver dropped. Discarding message.");
        }
    }
}

/// A publisher backed by a Unix socket connected to the master process.
pub struct IpcPublisher {
    tx: Option<std_mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl IpcPublisher {
    /// Creates a new `IpcPublisher` writing to the given socket.
    ///
    /// # Errors
    ///
    /// If the writer thread cannot be spawned, an error is returned.
    pub fn new(stream: UnixStream) -> Result<Self, IpcError> {
        let (tx, rx) = std_mpsc::channel();
        let writer = std::thread::Builder::new()
            .name("hearth-ipc-writer".to_string())
            .spawn(move || run_writer(stream, rx))
            .context(SpawnWriter)?;

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Creates a new `IpcPublisher` from the socket the master passed to this process.
    ///
    /// The descriptor is taken from the `HEARTH_IPC_FD` environment variable, and is marked close-on-exec so that it is
    /// not leaked into programs the worker later executes.
    ///
    /// # Errors
    ///
    /// If the environment variable is missing, or does not name an open file descriptor, an error is returned.
    pub fn from_env() -> Result<Self, IpcError> {
        let value = std::env::var(IPC_FD_ENV).map_err(|_| IpcError::MissingDescriptor { var: IPC_FD_ENV })?;
        let fd = value
            .trim()
            .parse::<RawFd>()
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| IpcError::InvalidDescriptor { value: value.clone() })?;

        // SAFETY: `fcntl` with `F_GETFD`/`F_SETFD` only inspects and updates descriptor flags.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
            return Err(IpcError::InvalidDescriptor { value });
        }

        // SAFETY: The descriptor is open, was handed to this process by the master for this sole purpose, and is only
        // ever wrapped once, here, so ownership is unique.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Self::new(stream)
    }

    fn shutdown(&mut self) {
        // Dropping the sender ends the writer loop once all queued messages are written.
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("IPC writer thread panicked.");
            }
        }
    }
}

impl Publisher for IpcPublisher {
    fn publish(&self, message: Message) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        if tx.send(message).is_err() {
            debug!("IPC writer stopped. Discarding message.");
        }
    }

    fn close(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for IpcPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(mut stream: UnixStream, rx: std_mpsc::Receiver<Message>) {
    for message in rx {
        let buf = match encode_message(&message) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "Dropping message that could not be encoded.");
                continue;
            }
        };

        if let Err(e) = stream.write_all(&buf) {
            // The master is gone. Nobody is left to tell.
            debug!(error = %e, "Failed to write to IPC socket. Stopping writer.");
            return;
        }
    }

    let _ = stream.flush();
    let _ = stream.shutdown(Shutdown::Write);
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead as _, BufReader};

    use super::*;
    use crate::traffic::TrafficSnapshot;

    #[test]
    fn lines_decode_back_into_messages() {
        let message = Message::heartbeat(4096);
        let line = encode_message(&message).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let decoded = decode_message(std::str::from_utf8(&line).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(decode_message("{\"type\":\"nope\"}"), Err(IpcError::Decode { .. })));
        assert!(matches!(decode_message("garbage"), Err(IpcError::Decode { .. })));
    }

    #[test]
    fn ipc_publisher_flushes_on_close() {
        let (worker_end, master_end) = UnixStream::pair().unwrap();
        let publisher: Box<dyn Publisher> = Box::new(IpcPublisher::new(worker_end).unwrap());

        publisher.publish(Message::spawn("nobody", "web"));
        publisher.publish(Message::traffic(TrafficSnapshot::default()));
        publisher.publish(Message::detach());
        publisher.close();

        let kinds = BufReader::new(master_end)
            .lines()
            .map(|line| decode_message(&line.unwrap()).unwrap().kind())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["spawn", "traffic", "detach"]);
    }

    #[test]
    fn channel_publisher_tolerates_dropped_receiver() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);
        publisher.publish(Message::detach());
    }
}
