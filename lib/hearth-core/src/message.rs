//! Worker-to-master messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{platform::monotonic_time_nanos, traffic::TrafficSnapshot};

/// Process identifier of a worker.
pub type Pid = u32;

/// A message from a worker process to the master process.
///
/// This is the complete set of facts a worker reports about itself. Every message carries the process identifier of
/// the emitting worker, which is stamped when the message is constructed.
///
/// For a given worker, `Spawn` is always the first message, and `Detach`, if sent, is always the last.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The worker has initialized and is about to start running.
    Spawn {
        /// Process identifier.
        pid: Pid,

        /// User the worker is running as.
        user: String,

        /// Name of the worker group.
        name: String,

        /// Wall-clock time at which the worker started.
        started_at: DateTime<Utc>,
    },

    /// Periodic liveness report.
    Heartbeat {
        /// Process identifier.
        pid: Pid,

        /// Resident memory of the worker, in bytes.
        memory_bytes: u64,

        /// Monotonic clock reading, in nanoseconds, at the time the heartbeat was created.
        monotonic_time_nanos: u64,
    },

    /// Periodic traffic counters.
    Traffic {
        /// Process identifier.
        pid: Pid,

        /// Traffic counters.
        #[serde(flatten)]
        snapshot: TrafficSnapshot,
    },

    /// The worker is about to replace itself with an external program.
    ///
    /// No further messages follow from this process identifier.
    Detach {
        /// Process identifier.
        pid: Pid,
    },
}

impl Message {
    /// Creates a `Spawn` message for the current process.
    pub fn spawn(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Spawn {
            pid: std::process::id(),
            user: user.into(),
            name: name.into(),
            started_at: Utc::now(),
        }
    }

    /// Creates a `Heartbeat` message for the current process.
    pub fn heartbeat(memory_bytes: u64) -> Self {
        Self::Heartbeat {
            pid: std::process::id(),
            memory_bytes,
            monotonic_time_nanos: monotonic_time_nanos(),
        }
    }

    /// Creates a `Traffic` message for the current process.
    pub fn traffic(snapshot: TrafficSnapshot) -> Self {
        Self::Traffic {
            pid: std::process::id(),
            snapshot,
        }
    }

    /// Creates a `Detach` message for the current process.
    pub fn detach() -> Self {
        Self::Detach {
            pid: std::process::id(),
        }
    }

    /// Returns the process identifier of the worker that emitted this message.
    pub const fn pid(&self) -> Pid {
        match self {
            Self::Spawn { pid, .. } | Self::Heartbeat { pid, .. } | Self::Traffic { pid, .. } | Self::Detach { pid } => {
                *pid
            }
        }
    }

    /// Returns the name of the message type.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Traffic { .. } => "traffic",
            Self::Detach { .. } => "detach",
        }
    }

    /// Returns `true` if no further messages may follow this one from the same process.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Detach { .. })
    }
}
