//! Server status.
//!
//! The master folds every message it receives from its workers into a [`ServerStatus`], which is what status queries
//! observe. Messages arrive with arbitrary interleaving across workers, and may arrive after the emitting process has
//! already been reaped, so applying a message never fails: anything that cannot be attributed to a live, managed worker
//! process is dropped.

use std::{collections::BTreeMap, io, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use hearth_core::{
    message::{Message, Pid},
    traffic::TrafficSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Status of a worker pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Name of the pool.
    pub name: String,

    /// User the pool's processes run as.
    pub user: String,

    /// Number of processes in the pool.
    pub count: usize,
}

/// Status of a single worker process.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProcessStatus {
    /// Process identifier.
    pub pid: Pid,

    /// Name of the pool the process belongs to.
    pub name: String,

    /// User the process runs as, once reported.
    pub user: Option<String>,

    /// Resident memory, in bytes, as of the last heartbeat.
    pub memory: u64,

    /// Time at which the process reported it started.
    pub started_at: Option<DateTime<Utc>>,

    /// Time at which the last heartbeat was received.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Whether the process has detached to run an external program.
    pub detached: bool,

    /// Traffic counters as of the last report.
    pub traffic: TrafficSnapshot,
}

impl ProcessStatus {
    fn new(pid: Pid, name: String) -> Self {
        Self {
            pid,
            name,
            user: None,
            memory: 0,
            started_at: None,
            last_heartbeat: None,
            detached: false,
            traffic: TrafficSnapshot::default(),
        }
    }
}

/// Status of the server: the master process and all of its workers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerStatus {
    /// Time at which the master started.
    pub started_at: DateTime<Utc>,

    /// Whether the master is running, as opposed to shutting down.
    pub running: bool,

    /// Configured worker pools.
    pub workers: Vec<WorkerStatus>,

    /// Live worker processes, by process identifier.
    pub processes: BTreeMap<Pid, ProcessStatus>,
}

impl ServerStatus {
    /// Creates a new `ServerStatus` for the given worker pools.
    pub fn new(workers: Vec<WorkerStatus>) -> Self {
        Self {
            started_at: Utc::now(),
            running: true,
            workers,
            processes: BTreeMap::new(),
        }
    }

    /// Registers a newly spawned worker process.
    ///
    /// Only messages from registered processes are applied.
    pub fn add_process<N: Into<String>>(&mut self, pid: Pid, name: N) {
        self.processes.insert(pid, ProcessStatus::new(pid, name.into()));
    }

    /// Removes a reaped worker process.
    ///
    /// Returns the last known status of the process, if it was registered.
    pub fn remove_process(&mut self, pid: Pid) -> Option<ProcessStatus> {
        self.processes.remove(&pid)
    }

    /// Returns the status of the given process.
    pub fn process(&self, pid: Pid) -> Option<&ProcessStatus> {
        self.processes.get(&pid)
    }

    /// Applies a message received from a worker at the given time.
    ///
    /// Returns `true` if the message was applied. Messages from unknown or detached processes are dropped.
    pub fn apply(&mut self, message: &Message, received_at: DateTime<Utc>) -> bool {
        let pid = message.pid();
        let Some(process) = self.processes.get_mut(&pid) else {
            debug!(pid, kind = message.kind(), "Dropping message from unknown process.");
            return false;
        };

        if process.detached {
            debug!(pid, kind = message.kind(), "Dropping message from detached process.");
            return false;
        }

        trace!(pid, kind = message.kind(), "Applying message.");
        match message {
            Message::Spawn {
                user, started_at, ..
            } => {
                process.user = Some(user.clone());
                process.started_at = Some(*started_at);
            }
            Message::Heartbeat { memory_bytes, .. } => {
                process.memory = *memory_bytes;
                process.last_heartbeat = Some(received_at);
            }
            Message::Traffic { snapshot, .. } => process.traffic = *snapshot,
            Message::Detach { .. } => {
                process.detached = true;
                process.memory = 0;
                process.traffic = TrafficSnapshot::default();
            }
        }

        true
    }

    /// Returns the worker processes that have not sent a heartbeat within `timeout` of `now`.
    ///
    /// Detached processes and processes that have not sent their first heartbeat yet are never unresponsive.
    pub fn unresponsive_processes(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Pid> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };

        self.processes
            .values()
            .filter(|process| !process.detached)
            .filter(|process| {
                process
                    .last_heartbeat
                    .is_some_and(|last_heartbeat| now.signed_duration_since(last_heartbeat) > timeout)
            })
            .map(|process| process.pid)
            .collect()
    }

    /// Returns the number of managed worker processes, excluding detached ones.
    pub fn processes_count(&self) -> usize {
        self.processes.values().filter(|process| !process.detached).count()
    }

    /// Returns the sum of the resident memory of all managed worker processes, in bytes.
    pub fn total_memory(&self) -> u64 {
        self.processes
            .values()
            .filter(|process| !process.detached)
            .map(|process| process.memory)
            .sum()
    }

    /// Returns the configured number of worker processes across all pools.
    pub fn workers_count(&self) -> usize {
        self.workers.iter().map(|worker| worker.count).sum()
    }

    /// Returns the traffic counters summed across all managed worker processes.
    pub fn total_traffic(&self) -> TrafficSnapshot {
        self.processes
            .values()
            .filter(|process| !process.detached)
            .fold(TrafficSnapshot::default(), |mut total, process| {
                total.connections += process.traffic.connections;
                total.packages += process.traffic.packages;
                total.rx += process.traffic.rx;
                total.tx += process.traffic.tx;
                total
            })
    }

    /// Writes the status to the given file as JSON.
    ///
    /// The status is written to a temporary file next to the target, which is then renamed over it, so readers never
    /// observe a partially written file.
    ///
    /// # Errors
    ///
    /// If the file cannot be written, an error is returned.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let contents = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)
    }

    /// Reads a status previously written with [`write_to_file`][Self::write_to_file].
    ///
    /// # Errors
    ///
    /// If the file cannot be read or does not contain a valid status, an error is returned.
    pub fn read_from_file(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read(path)?;
        serde_json::from_slice(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use proptest::prelude::*;

    use super::*;

    fn status() -> ServerStatus {
        ServerStatus::new(vec![
            WorkerStatus {
                name: "web".to_string(),
                user: "www-data".to_string(),
                count: 2,
            },
            WorkerStatus {
                name: "queue".to_string(),
                user: "www-data".to_string(),
                count: 1,
            },
        ])
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn spawn(pid: Pid) -> Message {
        Message::Spawn {
            pid,
            user: "www-data".to_string(),
            name: "web".to_string(),
            started_at: at(0),
        }
    }

    fn heartbeat(pid: Pid, memory_bytes: u64) -> Message {
        Message::Heartbeat {
            pid,
            memory_bytes,
            monotonic_time_nanos: 1,
        }
    }

    #[test]
    fn messages_update_registered_processes() {
        let mut status = status();
        status.add_process(10, "web");
        status.add_process(11, "web");

        assert!(status.apply(&spawn(10), at(1)));
        assert!(status.apply(&heartbeat(10, 1024), at(2)));
        assert!(status.apply(&heartbeat(11, 2048), at(2)));
        assert!(status.apply(
            &Message::Traffic {
                pid: 11,
                snapshot: TrafficSnapshot {
                    connections: 2,
                    packages: 40,
                    rx: 100,
                    tx: 200,
                },
            },
            at(3)
        ));

        let process = status.process(10).unwrap();
        assert_eq!(process.user.as_deref(), Some("www-data"));
        assert_eq!(process.started_at, Some(at(0)));
        assert_eq!(process.last_heartbeat, Some(at(2)));

        assert_eq!(status.processes_count(), 2);
        assert_eq!(status.total_memory(), 3072);
        assert_eq!(status.workers_count(), 3);
        assert_eq!(status.total_traffic().packages, 40);
    }

    #[test]
    fn messages_from_unknown_or_reaped_processes_are_dropped() {
        let mut status = status();
        assert!(!status.apply(&heartbeat(10, 1024), at(1)));

        status.add_process(10, "web");
        assert!(status.remove_process(10).is_some());
        assert!(!status.apply(&heartbeat(10, 1024), at(2)));
        assert!(status.processes.is_empty());
    }

    #[test]
    fn detached_processes_are_no_longer_managed() {
        let mut status = status();
        status.add_process(10, "web");
        status.apply(&heartbeat(10, 1024), at(1));
        assert!(status.apply(&Message::Detach { pid: 10 }, at(2)));

        assert!(!status.apply(&heartbeat(10, 4096), at(3)));
        assert!(status.process(10).unwrap().detached);
        assert_eq!(status.processes_count(), 0);
        assert_eq!(status.total_memory(), 0);
    }

    #[test]
    fn unresponsive_processes_are_reported() {
        let mut status = status();
        status.add_process(10, "web");
        status.add_process(11, "web");
        status.add_process(12, "web");
        status.apply(&heartbeat(10, 0), at(0));
        status.apply(&heartbeat(11, 0), at(8));

        assert_eq!(status.unresponsive_processes(at(10), Duration::from_secs(5)), vec![10]);
    }

    #[test]
    fn status_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let mut status = status();
        status.add_process(10, "web");
        status.apply(&spawn(10), at(1));
        status.apply(&heartbeat(10, 1024), at(2));

        status.write_to_file(&path).unwrap();
        assert_eq!(ServerStatus::read_from_file(&path).unwrap(), status);
    }

    #[derive(Clone, Debug)]
    enum Event {
        Spawned(Pid),
        Reaped(Pid),
        Received(Message),
    }

    fn arb_message(pid: Pid) -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(spawn(pid)),
            any::<u32>().prop_map(move |memory| heartbeat(pid, u64::from(memory))),
            any::<u16>().prop_map(move |packages| Message::Traffic {
                pid,
                snapshot: TrafficSnapshot {
                    connections: 1,
                    packages: u64::from(packages),
                    rx: 0,
                    tx: 0,
                },
            }),
            Just(Message::Detach { pid }),
        ]
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (1u32..6).prop_flat_map(|pid| {
            prop_oneof![
                1 => Just(Event::Spawned(pid)),
                1 => Just(Event::Reaped(pid)),
                6 => arb_message(pid).prop_map(Event::Received),
            ]
        })
    }

    proptest! {
        #[test]
        fn arbitrary_interleavings_keep_status_consistent(events in prop::collection::vec(arb_event(), 0..64)) {
            let mut status = status();
            let mut live = BTreeMap::new();

            for event in events {
                match event {
                    Event::Spawned(pid) => {
                        status.add_process(pid, "web");
                        live.insert(pid, false);
                    }
                    Event::Reaped(pid) => {
                        status.remove_process(pid);
                        live.remove(&pid);
                    }
                    Event::Received(message) => {
                        let pid = message.pid();
                        let expected = live.get(&pid).is_some_and(|detached| !detached);
                        prop_assert_eq!(status.apply(&message, at(0)), expected);
                        if expected && message.is_terminal() {
                            live.insert(pid, true);
                        }
                    }
                }
            }

            prop_assert_eq!(status.processes.keys().copied().collect::<Vec<_>>(), live.keys().copied().collect::<Vec<_>>());
            prop_assert_eq!(status.processes_count(), live.values().filter(|detached| !**detached).count());

            let memory = status.processes.values().filter(|p| !p.detached).map(|p| p.memory).sum::<u64>();
            prop_assert_eq!(status.total_memory(), memory);
            prop_assert!(status.processes.values().filter(|p| p.detached).all(|p| p.memory == 0));
        }
    }
}
