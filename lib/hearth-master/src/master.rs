//! The master process.
//!
//! The master spawns every configured worker process, folds the messages they send into the [`ServerStatus`], and
//! decides what to do whenever one of them exits:
//!
//! - exit code [`RELOAD_EXIT_CODE`]: the worker reloaded itself, and is replaced immediately.
//! - exit code [`STOP_EXIT_CODE`]: the worker stopped for good, and its slot is left empty.
//! - anything else, including termination by a signal: the worker crashed, and is replaced as allowed by the
//!   [restart policy](crate::restart::RestartPolicy).
//!
//! A worker that detached to run an external program is no longer managed, but its process is still a child of the
//! master: when it exits, its slot is treated as crashed unless it exited with [`STOP_EXIT_CODE`].

use std::collections::HashMap;

use chrono::Utc;
use hearth_app::bootstrap::PidFile;
use hearth_core::{
    message::Pid,
    worker::{ControlEvent, RELOAD_EXIT_CODE, STOP_EXIT_CODE},
};
use nix::sys::signal::{kill, Signal};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    pin, select,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, watch},
    time::{interval, sleep, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::MasterConfiguration,
    restart::{RestartAction, RestartState},
    spawn::{spawn_worker, ProcessEvent, ProcessExit, WorkerCommand},
    status::{ServerStatus, WorkerStatus},
};

/// Master errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum MasterError {
    /// No worker pools were configured.
    #[snafu(display("No workers configured."))]
    NoWorkers,

    /// A worker process could not be spawned.
    #[snafu(display("Failed to spawn worker process for '{}': {}", worker_name, source))]
    Spawn {
        /// Name of the worker pool.
        worker_name: String,

        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An I/O operation of the master failed.
    #[snafu(display("Failed to {}: {}", action, source))]
    Io {
        /// Operation that failed.
        action: String,

        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A signal handler could not be installed.
    #[snafu(display("Failed to install signal handler: {}", source))]
    SignalHandler {
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// A pool of identical worker processes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerPool {
    /// Name of the pool.
    pub name: String,

    /// Number of processes to run.
    pub count: usize,

    /// Whether the processes are reloaded when the master is asked to reload.
    pub reloadable: bool,

    /// User the processes run as.
    pub user: String,
}

impl WorkerPool {
    fn to_status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.name.clone(),
            user: self.user.clone(),
            count: self.count,
        }
    }
}

/// A worker process slot: a position within a pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct Slot {
    pool: usize,
    index: usize,
}

/// A handle for controlling a running [`Master`].
#[derive(Clone, Debug)]
pub struct MasterHandle {
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl MasterHandle {
    /// Gracefully stops the master and all of its workers.
    ///
    /// Stopping again while the master is already stopping kills all remaining workers.
    pub fn stop(&self) {
        let _ = self.control_tx.send(ControlEvent::Stop);
    }

    /// Gracefully reloads all workers of reloadable pools.
    pub fn reload(&self) {
        let _ = self.control_tx.send(ControlEvent::Reload);
    }
}

/// The master process.
pub struct Master {
    config: MasterConfiguration,
    command: WorkerCommand,
    pools: Vec<WorkerPool>,
    status_tx: watch::Sender<ServerStatus>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Master {
    /// Creates a new `Master` running the given worker pools, spawning worker processes with `command`.
    pub fn new(config: MasterConfiguration, command: WorkerCommand, pools: Vec<WorkerPool>) -> Self {
        let status = ServerStatus::new(pools.iter().map(WorkerPool::to_status).collect());
        let (status_tx, _) = watch::channel(status);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            config,
            command,
            pools,
            status_tx,
            control_tx,
            control_rx,
        }
    }

    /// Returns a receiver of the latest server status.
    pub fn status(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    /// Returns a handle for controlling the master.
    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            control_tx: self.control_tx.clone(),
        }
    }

    /// Runs the master until it stops, controlled by process signals.
    ///
    /// `SIGTERM` and `SIGINT` stop the master, and `SIGUSR2` reloads all reloadable workers.
    ///
    /// # Errors
    ///
    /// If the signal handlers cannot be installed, or the master fails to run, an error is returned.
    pub async fn run(self) -> Result<(), MasterError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalHandler)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalHandler)?;
        let mut sigusr2 = signal(SignalKind::user_defined2()).context(SignalHandler)?;

        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = select! {
                    _ = sigterm.recv() => ControlEvent::Stop,
                    _ = sigint.recv() => ControlEvent::Stop,
                    _ = sigusr2.recv() => ControlEvent::Reload,
                };

                debug!(?event, "Received control signal.");
                if control_tx.send(event).is_err() {
                    break;
                }
            }
        });

        self.run_until_stopped().await
    }

    /// Runs the master until it is stopped through a [`MasterHandle`], or until all workers have stopped for good.
    ///
    /// # Errors
    ///
    /// If no workers are configured, the PID file cannot be written, or the initial worker processes cannot be
    /// spawned, an error is returned.
    pub async fn run_until_stopped(mut self) -> Result<(), MasterError> {
        if self.pools.iter().all(|pool| pool.count == 0) {
            return Err(MasterError::NoWorkers);
        }

        let _pid_file = match &self.config.pid_file {
            Some(path) => Some(PidFile::create(path).context(Io {
                action: format!("write PID file '{}'", path.display()),
            })?),
            None => None,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (respawn_tx, mut respawn_rx) = mpsc::unbounded_channel();
        let mut supervision = Supervision::new(
            &self.config,
            &self.command,
            &self.pools,
            &self.status_tx,
            events_tx,
            respawn_tx,
        );

        info!(workers = supervision.status.workers_count(), "Master starting.");
        if let Err(e) = supervision.spawn_all() {
            supervision.abort();
            return Err(e);
        }

        let mut status_ticker = interval(self.config.status_interval());
        status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let kill_timer = sleep(self.config.shutdown_timeout());
        pin!(kill_timer);
        let mut kill_armed = false;

        while !supervision.is_finished() {
            select! {
                Some(event) = events_rx.recv() => supervision.handle_event(event),
                Some(slot) = respawn_rx.recv() => {
                    supervision.pending_restarts = supervision.pending_restarts.saturating_sub(1);
                    supervision.respawn(slot);
                },
                Some(event) = self.control_rx.recv() => match event {
                    ControlEvent::Stop if supervision.shutting_down => {
                        warn!("Stop requested again. Killing remaining workers.");
                        supervision.signal_all(Signal::SIGKILL);
                    }
                    ControlEvent::Stop => {
                        supervision.begin_shutdown();
                        kill_timer.as_mut().reset(Instant::now() + self.config.shutdown_timeout());
                        kill_armed = true;
                    }
                    ControlEvent::Reload => supervision.reload(),
                },
                () = &mut kill_timer, if kill_armed => {
                    kill_armed = false;
                    warn!(remaining = supervision.processes.len(), "Workers did not stop in time. Killing them.");
                    supervision.signal_all(Signal::SIGKILL);
                },
                _ = status_ticker.tick() => supervision.on_status_tick(),
            }
        }

        supervision.status.running = false;
        supervision.publish_status();
        supervision.write_status_file();

        info!("Master stopped.");
        Ok(())
    }
}

struct Supervision<'a> {
    config: &'a MasterConfiguration,
    command: &'a WorkerCommand,
    pools: &'a [WorkerPool],
    status_tx: &'a watch::Sender<ServerStatus>,
    status: ServerStatus,
    processes: HashMap<Pid, Slot>,
    restart_state: RestartState,
    pending_restarts: usize,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    respawn_tx: mpsc::UnboundedSender<Slot>,
    shutting_down: bool,
}

impl<'a> Supervision<'a> {
    fn new(
        config: &'a MasterConfiguration,
        command: &'a WorkerCommand,
        pools: &'a [WorkerPool],
        status_tx: &'a watch::Sender<ServerStatus>,
        events_tx: mpsc::UnboundedSender<ProcessEvent>,
        respawn_tx: mpsc::UnboundedSender<Slot>,
    ) -> Self {
        Self {
            config,
            command,
            pools,
            status_tx,
            status: status_tx.borrow().clone(),
            processes: HashMap::new(),
            restart_state: RestartState::new(config.restart_policy()),
            pending_restarts: 0,
            events_tx,
            respawn_tx,
            shutting_down: false,
        }
    }

    fn is_finished(&self) -> bool {
        if self.shutting_down {
            return self.processes.is_empty();
        }

        if self.processes.is_empty() && self.pending_restarts == 0 {
            info!("All workers stopped.");
            return true;
        }

        false
    }

    fn spawn_all(&mut self) -> Result<(), MasterError> {
        let pools = self.pools;
        for (pool, worker) in pools.iter().enumerate() {
            for index in 0..worker.count {
                self.spawn(Slot { pool, index }).context(Spawn {
                    worker_name: &worker.name,
                })?;
            }
        }

        self.publish_status();
        Ok(())
    }

    fn spawn(&mut self, slot: Slot) -> std::io::Result<Pid> {
        let name = self.pools[slot.pool].name.as_str();
        let pid = spawn_worker(self.command, name, slot.index, self.events_tx.clone())?;

        self.processes.insert(pid, slot);
        self.status.add_process(pid, name);
        Ok(pid)
    }

    fn respawn(&mut self, slot: Slot) {
        if self.shutting_down {
            return;
        }

        let pools = self.pools;
        let worker_name = pools[slot.pool].name.as_str();
        match self.spawn(slot) {
            Ok(pid) => {
                info!(worker_name, worker_index = slot.index, pid, "Worker process started.");
                self.publish_status();
            }
            Err(e) => {
                error!(worker_name, worker_index = slot.index, error = %e, "Failed to spawn worker process.");
                self.schedule_restart(slot);
            }
        }
    }

    fn schedule_restart(&mut self, slot: Slot) {
        match self.restart_state.evaluate_restart() {
            RestartAction::Restart => self.respawn(slot),
            RestartAction::Delay(delay) => {
                warn!(
                    worker_name = %self.pools[slot.pool].name,
                    worker_index = slot.index,
                    ?delay,
                    "Restarting worker too often. Delaying restart."
                );

                self.pending_restarts += 1;
                let respawn_tx = self.respawn_tx.clone();
                let at = Instant::now() + delay;
                tokio::spawn(async move {
                    sleep_until(at).await;
                    let _ = respawn_tx.send(slot);
                });
            }
        }
    }

    fn handle_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Message(message) => {
                if self.status.apply(&message, Utc::now()) {
                    if message.is_terminal() {
                        info!(pid = message.pid(), "Worker process detached.");
                    }
                    self.publish_status();
                }
            }
            ProcessEvent::Exited { pid, exit } => self.handle_exit(pid, exit),
        }
    }

    fn handle_exit(&mut self, pid: Pid, exit: ProcessExit) {
        let Some(slot) = self.processes.remove(&pid) else {
            debug!(pid, ?exit, "Unknown process exited.");
            return;
        };

        let detached = self.status.remove_process(pid).is_some_and(|process| process.detached);
        self.publish_status();

        let pools = self.pools;
        let worker_name = pools[slot.pool].name.as_str();
        if self.shutting_down {
            info!(worker_name, pid, ?exit, "Worker process exited.");
            return;
        }

        match exit {
            ProcessExit::Code(STOP_EXIT_CODE) => {
                info!(worker_name, worker_index = slot.index, pid, detached, "Worker process stopped.");
            }
            ProcessExit::Code(RELOAD_EXIT_CODE) if !detached => {
                info!(worker_name, worker_index = slot.index, pid, "Worker process reloaded.");
                self.respawn(slot);
            }
            exit => {
                warn!(worker_name, worker_index = slot.index, pid, ?exit, detached, "Worker process crashed.");
                self.schedule_restart(slot);
            }
        }
    }

    fn begin_shutdown(&mut self) {
        info!(remaining = self.processes.len(), "Stopping all workers.");
        self.shutting_down = true;
        self.status.running = false;
        self.publish_status();
        self.signal_all(ControlEvent::Stop.signal());
    }

    /// Kills every spawned process, leaving none of them unsupervised.
    fn abort(&mut self) {
        if self.processes.is_empty() {
            return;
        }

        warn!(remaining = self.processes.len(), "Aborting. Killing spawned workers.");
        self.shutting_down = true;
        self.signal_all(Signal::SIGKILL);
    }

    fn reload(&self) {
        if self.shutting_down {
            return;
        }

        info!("Reloading workers.");
        for (pid, slot) in &self.processes {
            let reloadable = self.pools[slot.pool].reloadable;
            let detached = self.status.process(*pid).is_some_and(|process| process.detached);
            if reloadable && !detached {
                signal_process(*pid, ControlEvent::Reload.signal());
            }
        }
    }

    fn signal_all(&self, signal: Signal) {
        for pid in self.processes.keys() {
            signal_process(*pid, signal);
        }
    }

    fn on_status_tick(&mut self) {
        if let Some(timeout) = self.config.heartbeat_timeout() {
            for pid in self.status.unresponsive_processes(Utc::now(), timeout) {
                warn!(pid, ?timeout, "Worker process has not sent a heartbeat in time.");
            }
        }

        self.write_status_file();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn write_status_file(&self) {
        if let Some(path) = &self.config.status_file {
            if let Err(e) = self.status.write_to_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to write status file.");
            }
        }
    }
}

fn signal_process(pid: Pid, signal: Signal) {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return;
    };

    if let Err(e) = kill(nix::unistd::Pid::from_raw(raw_pid), signal) {
        debug!(pid, ?signal, error = %e, "Failed to signal worker process.");
    }
}
