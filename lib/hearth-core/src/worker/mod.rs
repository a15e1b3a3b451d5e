//! Worker processes.
//!
//! A [`WorkerProcess`] is the unit of execution supervised by the master: a long-lived OS process running one event
//! loop, on which the application-defined hooks and services run. While running, the worker reports to the master
//! through a [`Publisher`]: it announces itself once it is initialized, sends a heartbeat at startup and then on a
//! fixed period, and sends its traffic counters whenever they change.
//!
//! Workers are controlled by the master with signals: `SIGTERM` stops the worker gracefully, and `SIGUSR2` reloads it
//! gracefully. A reloading worker exits with [`RELOAD_EXIT_CODE`], which tells the master to spawn a replacement.

use std::{collections::HashMap, ffi::OsStr, os::unix::process::CommandExt as _, process::Command, time::Duration};

use snafu::ResultExt as _;
use tokio::task::LocalSet;
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::{
    error::{AlreadyStarted, GenericError, RuntimeBuild, WorkerError},
    event_loop::{EventLoop, LoopHandle},
    ipc::{Publisher, IPC_FD_ENV, WORKER_INDEX_ENV, WORKER_NAME_ENV},
    memory::{MemoryProbe as _, Querier},
    message::{Message, Pid},
    platform::set_process_title,
    privileges::{current_group, current_user, set_user_and_group},
    reload::{ReloadStrategy, ReloadStrategyTrigger, ReloadTarget},
    traffic::{TrafficSnapshot, TrafficStatus},
};

mod service;
pub use self::service::{Service, ServiceContext};

mod state;
pub use self::state::{ControlEvent, LifecycleState, RELOAD_EXIT_CODE, STOP_EXIT_CODE};

/// Interval between heartbeats.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

/// Interval between checks for changed traffic counters.
pub const TRAFFIC_PERIOD: Duration = Duration::from_secs(1);

/// A worker lifecycle hook.
pub type Hook = Box<dyn FnMut(&mut WorkerProcess) -> Result<(), GenericError>>;

/// A worker error handler.
pub type ErrorHook = Box<dyn FnMut(&mut WorkerProcess, &GenericError)>;

/// A hook run right before the worker process is replaced with an external program.
pub type ExecHook = Box<dyn FnOnce()>;

#[derive(Clone, Copy, Debug)]
enum HookKind {
    Start,
    Stop,
    Reload,
}

impl HookKind {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "on_start",
            Self::Stop => "on_stop",
            Self::Reload => "on_reload",
        }
    }
}

/// Stops the event loop when dropped.
///
/// Stop and reload hooks run while this is alive, so the loop halts even if a hook panics.
struct StopGuard(Option<LoopHandle<WorkerProcess>>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.stop();
        }
    }
}

/// A worker process.
pub struct WorkerProcess {
    name: String,
    index: usize,
    count: usize,
    reloadable: bool,
    user: Option<String>,
    group: Option<String>,
    env: HashMap<String, String>,
    pid: Pid,
    state: LifecycleState,
    exit_code: i32,

    on_start: Option<Hook>,
    on_stop: Option<Hook>,
    on_reload: Option<Hook>,
    error_handler: Option<ErrorHook>,
    exec_hook: Option<ExecHook>,

    pending_strategies: Vec<Box<dyn ReloadStrategy>>,
    pending_services: Vec<Box<dyn Service>>,
    services: Vec<Box<dyn Service>>,

    event_loop: Option<LoopHandle<WorkerProcess>>,
    publisher: Option<Box<dyn Publisher>>,
    traffic: Option<TrafficStatus>,
    last_traffic: TrafficSnapshot,
    reload_trigger: Option<ReloadStrategyTrigger<WorkerProcess>>,
    memory: Querier,
}

impl WorkerProcess {
    /// Creates a new `WorkerProcess` for the given worker group.
    ///
    /// Defaults to a single, reloadable process running as the current user.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            index: 0,
            count: 1,
            reloadable: true,
            user: None,
            group: None,
            env: HashMap::new(),
            pid: std::process::id(),
            state: LifecycleState::Created,
            exit_code: STOP_EXIT_CODE,
            on_start: None,
            on_stop: None,
            on_reload: None,
            error_handler: None,
            exec_hook: None,
            pending_strategies: Vec::new(),
            pending_services: Vec::new(),
            services: Vec::new(),
            event_loop: None,
            publisher: None,
            traffic: None,
            last_traffic: TrafficSnapshot::default(),
            reload_trigger: None,
            memory: Querier::new(),
        }
    }

    /// Sets the index of this process within its worker group.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Sets the number of processes in the worker group.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    /// Sets whether the worker can be reloaded.
    ///
    /// Reloading a worker that is not reloadable does nothing.
    pub fn with_reloadable(mut self, reloadable: bool) -> Self {
        self.reloadable = reloadable;
        self
    }

    /// Sets the user the worker runs as.
    pub fn with_user<U: Into<String>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the group the worker runs as.
    pub fn with_group<G: Into<String>>(mut self, group: G) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Adds an environment variable override for programs executed with [`exec`][Self::exec].
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the hook called once the worker is running.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut WorkerProcess) -> Result<(), GenericError> + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Sets the hook called when the worker is stopping.
    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut WorkerProcess) -> Result<(), GenericError> + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Sets the hook called when the worker is reloading.
    pub fn on_reload<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut WorkerProcess) -> Result<(), GenericError> + 'static,
    {
        self.on_reload = Some(Box::new(hook));
        self
    }

    /// Sets the handler called for every application error raised while the worker is running.
    ///
    /// Errors are logged, and presented to the reload strategies, whether or not a handler is set.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut WorkerProcess, &GenericError) + 'static,
    {
        self.error_handler = Some(Box::new(handler));
        self
    }

    /// Sets the hook run right before the process is replaced by [`exec`][Self::exec].
    ///
    /// Anything buffered in the process, such as pending log output, is lost once the program is executed, and should
    /// be flushed by this hook.
    pub fn with_exec_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.exec_hook = Some(Box::new(hook));
        self
    }

    /// Adds reload strategies, installed when the worker starts.
    pub fn with_reload_strategies<I>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn ReloadStrategy>>,
    {
        self.add_reload_strategies(strategies);
        self
    }

    /// Returns the name of the worker group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the index of this process within its worker group.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the number of processes in the worker group.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if the worker can be reloaded.
    pub fn is_reloadable(&self) -> bool {
        self.reloadable
    }

    /// Returns the user the worker runs as.
    pub fn user(&self) -> String {
        self.user.clone().unwrap_or_else(current_user)
    }

    /// Returns the group the worker runs as.
    pub fn group(&self) -> String {
        self.group.clone().unwrap_or_else(current_group)
    }

    /// Returns the process identifier of the worker.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the exit code the worker exits with.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns the event loop of the worker, while it is running.
    pub fn event_loop(&self) -> Option<&LoopHandle<WorkerProcess>> {
        self.event_loop.as_ref()
    }

    /// Returns the traffic counters of the worker, once it has started.
    pub fn traffic_status(&self) -> Option<&TrafficStatus> {
        self.traffic.as_ref()
    }

    /// Returns the reload trigger of the worker, while it is running.
    pub fn reload_trigger(&mut self) -> Option<&mut ReloadStrategyTrigger<WorkerProcess>> {
        self.reload_trigger.as_mut()
    }

    /// Adds reload strategies.
    ///
    /// Strategies added before the worker runs are installed when it starts.
    pub fn add_reload_strategies<I>(&mut self, strategies: I)
    where
        I: IntoIterator<Item = Box<dyn ReloadStrategy>>,
    {
        match self.reload_trigger.as_mut() {
            Some(trigger) => trigger.add_reload_strategies(strategies),
            None => self.pending_strategies.extend(strategies),
        }
    }

    /// Starts an application service.
    ///
    /// Services added before the worker runs are started right after the `on_start` hook.
    ///
    /// # Errors
    ///
    /// If the worker is no longer running, or the service fails to start, an error is returned.
    pub fn start_service<S>(&mut self, service: S) -> Result<(), GenericError>
    where
        S: Service + 'static,
    {
        if self.state == LifecycleState::Created {
            self.pending_services.push(Box::new(service));
            return Ok(());
        }

        self.start_boxed_service(Box::new(service))
    }

    fn start_boxed_service(&mut self, mut service: Box<dyn Service>) -> Result<(), GenericError> {
        let (Some(loop_handle), Some(traffic), true) =
            (self.event_loop.clone(), self.traffic.clone(), self.state.is_active())
        else {
            return Err(crate::generic_error!(
                "Cannot start service '{}' while worker is {}.",
                service.name(),
                self.state
            ));
        };

        service.start(ServiceContext::new(loop_handle, traffic))?;
        debug!(service = service.name(), "Started service.");
        self.services.push(service);
        Ok(())
    }

    fn stop_services(&mut self) {
        for mut service in std::mem::take(&mut self.services) {
            debug!(service = service.name(), "Stopping service.");
            service.stop();
        }
    }

    /// Runs the worker until it stops, returning its exit code.
    ///
    /// A dedicated single-threaded runtime is built to run the event loop on. To run the worker on an existing runtime,
    /// use [`run_until_stopped`][Self::run_until_stopped] instead.
    ///
    /// # Errors
    ///
    /// If the runtime cannot be built, or the worker was already run, an error is returned.
    pub fn run(mut self, publisher: Box<dyn Publisher>) -> Result<i32, WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context(RuntimeBuild {
                worker_name: &self.name,
            })?;

        runtime.block_on(self.run_until_stopped(publisher))
    }

    /// Runs the worker on the current runtime until it stops, returning its exit code.
    ///
    /// Must be called from within a current-thread Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the worker was already run, an error is returned.
    pub async fn run_until_stopped(&mut self, publisher: Box<dyn Publisher>) -> Result<i32, WorkerError> {
        if self.state != LifecycleState::Created {
            return AlreadyStarted {
                worker_name: &self.name,
                state: self.state,
            }
            .fail();
        }

        let span = info_span!("worker", worker_name = %self.name, worker_index = self.index, pid = self.pid);
        let local = LocalSet::new();
        local.run_until(self.run_inner(publisher).instrument(span)).await;

        Ok(self.exit_code)
    }

    async fn run_inner(&mut self, publisher: Box<dyn Publisher>) {
        self.state = LifecycleState::Initializing;
        self.publisher = Some(publisher);

        if let Err(e) = set_user_and_group(self.user.as_deref(), self.group.as_deref()) {
            warn!(error = %e, "Failed to change user or group. Continuing as the current user.");
            self.user = Some(current_user());
            self.group = Some(current_group());
        }

        if !set_process_title(&format!("hearth/{}", self.name)) {
            debug!("Process title not set.");
        }

        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        self.event_loop = Some(handle.clone());

        handle.set_error_handler(|worker: &mut WorkerProcess, e| worker.handle_error(e));
        handle.defer(|worker| {
            worker.state = LifecycleState::Running;
            if let Err(e) = worker.run_hook(HookKind::Start) {
                worker.handle_error(e);
            }
            worker.start_pending_services();
            Ok(())
        });
        for event in [ControlEvent::Stop, ControlEvent::Reload] {
            handle.on_signal(event.signal(), move |worker| {
                worker.handle_control(event);
                Ok(())
            });
        }

        self.traffic = Some(TrafficStatus::new());
        let mut trigger = ReloadStrategyTrigger::new(handle.clone());
        trigger.add_reload_strategies(std::mem::take(&mut self.pending_strategies));
        self.reload_trigger = Some(trigger);

        self.publish(Message::spawn(self.user(), self.name.clone()));
        self.publish_heartbeat();
        handle.repeat(HEARTBEAT_PERIOD, |worker| {
            worker.publish_heartbeat();
            Ok(())
        });
        handle.repeat(TRAFFIC_PERIOD, |worker| {
            worker.publish_traffic();
            Ok(())
        });

        info!(user = %self.user(), "Worker started.");
        event_loop.run(self).await;
        drop(event_loop);

        self.event_loop = None;
        self.reload_trigger = None;
        self.stop_services();
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }
        self.state = LifecycleState::Terminated;

        info!(exit_code = self.exit_code, "Worker stopped.");
    }

    fn start_pending_services(&mut self) {
        for service in std::mem::take(&mut self.pending_services) {
            if let Err(e) = self.start_boxed_service(service) {
                self.handle_error(e);
            }
        }
    }

    /// Handles a control event.
    pub fn handle_control(&mut self, event: ControlEvent) {
        debug!(?event, "Received control event.");
        match event {
            ControlEvent::Stop => self.stop(STOP_EXIT_CODE),
            ControlEvent::Reload => self.reload(),
        }
    }

    /// Gracefully stops the worker with the given exit code.
    ///
    /// The `on_stop` hook is called, and the event loop is stopped even if the hook fails. Only the first call has any
    /// effect: once the worker is stopping, reloading, or detaching, this does nothing.
    pub fn stop(&mut self, code: i32) {
        if !self.state.is_active() {
            return;
        }

        info!(exit_code = code, "Stopping worker.");
        self.state = LifecycleState::StoppingForExit;
        self.exit_code = code;
        self.shutdown(HookKind::Stop);
    }

    /// Gracefully reloads the worker.
    ///
    /// The `on_reload` hook is called, and the event loop is stopped even if the hook fails. The worker exits with
    /// [`RELOAD_EXIT_CODE`], which tells the master to start a replacement. Does nothing if the worker is not
    /// reloadable, or if it is already stopping, reloading, or detaching.
    pub fn reload(&mut self) {
        if !self.reloadable {
            debug!("Worker is not reloadable. Ignoring reload.");
            return;
        }

        if !self.state.is_active() {
            return;
        }

        info!("Reloading worker.");
        self.state = LifecycleState::StoppingForReload;
        self.exit_code = RELOAD_EXIT_CODE;
        self.shutdown(HookKind::Reload);
    }

    fn shutdown(&mut self, hook: HookKind) {
        let _guard = StopGuard(self.event_loop.clone());

        if let Some(trigger) = self.reload_trigger.as_mut() {
            trigger.cancel_timers();
        }
        self.stop_services();
        if let Err(e) = self.run_hook(hook) {
            self.handle_error(e);
        }
    }

    /// Replaces the worker process with an external program.
    ///
    /// All event loop registrations are cancelled, the master is told that this process is no longer a worker, and all
    /// worker resources are released before the program is executed. The program inherits the environment of the
    /// worker, with any overrides set through [`with_env`][Self::with_env] applied.
    ///
    /// Never returns. If the program cannot be executed, the failure is reported on standard error and the process
    /// exits with code 0.
    pub fn exec<P, I, S>(&mut self, path: P, args: I) -> !
    where
        P: AsRef<OsStr>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let path = path.as_ref();
        let exec_hook = self.exec_hook.take();
        self.detach();

        info!(program = %path.to_string_lossy(), "Executing external program.");
        let flushed = match exec_hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        };

        let error = Command::new(path)
            .args(args)
            .env_remove(IPC_FD_ENV)
            .env_remove(WORKER_NAME_ENV)
            .env_remove(WORKER_INDEX_ENV)
            .envs(&self.env)
            .exec();

        error!(program = %path.to_string_lossy(), error = %error, "Failed to execute external program.");
        if flushed {
            // Logging may no longer be running.
            eprintln!(
                "worker '{}' (pid {}): Failed to execute external program '{}': {}",
                self.name,
                self.pid,
                path.to_string_lossy(),
                error
            );
        }
        std::process::exit(STOP_EXIT_CODE)
    }

    fn detach(&mut self) {
        if !self.state.is_active() {
            return;
        }

        self.state = LifecycleState::Detaching;

        if let Some(handle) = self.event_loop.take() {
            for id in handle.identifiers() {
                handle.cancel(id);
            }
            handle.stop();
        }

        self.stop_services();
        self.publish(Message::detach());
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }

        self.traffic = None;
        self.reload_trigger = None;
        self.pending_strategies.clear();
        self.pending_services.clear();
        self.on_start = None;
        self.on_stop = None;
        self.on_reload = None;
        self.error_handler = None;
    }

    fn run_hook(&mut self, kind: HookKind) -> Result<(), GenericError> {
        let Some(mut hook) = self.hook_slot(kind).take() else {
            return Ok(());
        };

        debug!(hook = kind.as_str(), "Running hook.");
        let result = hook(self);

        // Hooks are released on detach, and may also have been replaced while running.
        if self.state != LifecycleState::Detaching {
            let slot = self.hook_slot(kind);
            if slot.is_none() {
                *slot = Some(hook);
            }
        }

        result
    }

    fn hook_slot(&mut self, kind: HookKind) -> &mut Option<Hook> {
        match kind {
            HookKind::Start => &mut self.on_start,
            HookKind::Stop => &mut self.on_stop,
            HookKind::Reload => &mut self.on_reload,
        }
    }

    fn handle_error(&mut self, e: GenericError) {
        error!(error = %e, "Error raised in worker.");

        if let Some(mut handler) = self.error_handler.take() {
            handler(self, &e);
            if self.state != LifecycleState::Detaching && self.error_handler.is_none() {
                self.error_handler = Some(handler);
            }
        }

        if let Some(trigger) = self.reload_trigger.as_mut() {
            trigger.emit_exception(&e);
        }
    }

    fn publish(&self, message: Message) {
        match self.publisher.as_ref() {
            Some(publisher) => publisher.publish(message),
            None => debug!(kind = message.kind(), "No publisher. Discarding message."),
        }
    }

    fn publish_heartbeat(&mut self) {
        let memory = self.memory.resident_set_size().unwrap_or(0);
        self.publish(Message::heartbeat(memory));
    }

    fn publish_traffic(&mut self) {
        let Some(snapshot) = self.traffic.as_ref().map(TrafficStatus::snapshot) else {
            return;
        };

        if snapshot != self.last_traffic {
            self.last_traffic = snapshot;
            self.publish(Message::traffic(snapshot));
        }
    }
}

impl ReloadTarget for WorkerProcess {
    fn reload_trigger_mut(&mut self) -> Option<&mut ReloadStrategyTrigger<Self>> {
        self.reload_trigger.as_mut()
    }

    fn reload(&mut self) {
        WorkerProcess::reload(self);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use nix::sys::signal::Signal;
    use tokio::{
        sync::mpsc,
        task::{spawn_local, JoinHandle},
        time::sleep,
    };

    use super::*;
    use crate::{
        generic_error,
        ipc::ChannelPublisher,
        reload::{ExceptionReloadStrategy, MaxMemoryReloadStrategy, MaxRequestsReloadStrategy},
    };

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn run(mut worker: WorkerProcess) -> (WorkerProcess, i32, Vec<Message>) {
        let (publisher, mut rx) = ChannelPublisher::new();
        let exit_code = worker.run_until_stopped(Box::new(publisher)).await.unwrap();
        let messages = drain(&mut rx);
        (worker, exit_code, messages)
    }

    fn counter() -> (Rc<Cell<usize>>, impl FnMut(&mut WorkerProcess) -> Result<(), GenericError>) {
        let count = Rc::new(Cell::new(0));
        let hook_count = Rc::clone(&count);
        (count, move |_: &mut WorkerProcess| {
            hook_count.set(hook_count.get() + 1);
            Ok(())
        })
    }

    fn stop_after(delay: Duration, code: i32) -> impl FnMut(&mut WorkerProcess) -> Result<(), GenericError> {
        move |worker: &mut WorkerProcess| {
            if let Some(handle) = worker.event_loop() {
                handle.delay(delay, move |worker| {
                    worker.stop(code);
                    Ok(())
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn exit_code_defaults_to_zero() {
        let worker = WorkerProcess::new("web").on_start(|worker| {
            if let Some(handle) = worker.event_loop() {
                handle.stop();
            }
            Ok(())
        });

        let (worker, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, STOP_EXIT_CODE);
        assert_eq!(worker.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn worker_cannot_run_twice() {
        let mut worker = WorkerProcess::new("web").on_start(stop_after(Duration::ZERO, 0));
        let (publisher, _rx) = ChannelPublisher::new();
        worker.run_until_stopped(Box::new(publisher)).await.unwrap();

        let (publisher, _rx) = ChannelPublisher::new();
        let result = worker.run_until_stopped(Box::new(publisher)).await;
        assert!(matches!(result, Err(WorkerError::AlreadyStarted { .. })));
    }

    #[tokio::test]
    async fn unknown_user_falls_back_to_the_current_user() {
        let worker = WorkerProcess::new("web")
            .with_user("hearth-no-such-user")
            .with_group("hearth-no-such-group")
            .on_start(stop_after(Duration::ZERO, 0));

        let (worker, exit_code, messages) = run(worker).await;
        assert_eq!(exit_code, STOP_EXIT_CODE);
        assert_eq!(worker.user(), current_user());
        assert!(matches!(messages.first(), Some(Message::Spawn { user, .. }) if *user == current_user()));
    }

    #[tokio::test]
    async fn reload_is_ignored_when_not_reloadable() {
        let (reloads, on_reload) = counter();
        let mut stop_later = stop_after(Duration::from_millis(10), 7);
        let worker = WorkerProcess::new("web")
            .with_reloadable(false)
            .on_reload(on_reload)
            .on_start(move |worker| {
                worker.reload();
                assert_eq!(worker.state(), LifecycleState::Running);
                assert_eq!(worker.exit_code(), STOP_EXIT_CODE);
                stop_later(worker)
            });

        let (_, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, 7);
        assert_eq!(reloads.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_precedes_heartbeats_on_a_fixed_cadence() {
        let worker = WorkerProcess::new("web").on_start(stop_after(Duration::from_secs(10), 0));

        let (_, _, messages) = run(worker).await;
        let kinds = messages.iter().map(Message::kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec!["spawn", "heartbeat", "heartbeat", "heartbeat", "heartbeat"]);

        let timestamps = messages
            .iter()
            .filter_map(|message| match message {
                Message::Heartbeat {
                    monotonic_time_nanos, ..
                } => Some(*monotonic_time_nanos),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));

        let pid = std::process::id();
        assert!(messages.iter().all(|message| message.pid() == pid));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_is_published_only_when_changed() {
        let worker = WorkerProcess::new("web").on_start(|worker| {
            let traffic = worker.traffic_status().cloned();
            if let Some(handle) = worker.event_loop() {
                handle.delay(Duration::from_millis(1500), move |_| {
                    if let Some(traffic) = &traffic {
                        traffic.connection_opened();
                        traffic.add_rx(128);
                    }
                    Ok(())
                });
                handle.delay(Duration::from_millis(4500), |worker| {
                    worker.stop(0);
                    Ok(())
                });
            }
            Ok(())
        });

        let (_, _, messages) = run(worker).await;
        let traffic = messages
            .iter()
            .filter_map(|message| match message {
                Message::Traffic { snapshot, .. } => Some(*snapshot),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            traffic,
            vec![TrafficSnapshot {
                connections: 1,
                packages: 0,
                rx: 128,
                tx: 0,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn on_start_runs_before_any_timer() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let probe_log = Rc::clone(&log);
        let probe = move || {
            probe_log.borrow_mut().push("timer");
            None::<u64>
        };
        let strategy = MaxMemoryReloadStrategy::new(bytesize::ByteSize::mb(1))
            .with_check_interval(Duration::from_millis(1))
            .with_probe(probe);

        let start_log = Rc::clone(&log);
        let mut stop_later = stop_after(Duration::from_millis(5), 0);
        let worker = WorkerProcess::new("web")
            .with_count(1)
            .with_reload_strategies([Box::new(strategy) as Box<dyn ReloadStrategy>])
            .on_start(move |worker| {
                start_log.borrow_mut().push("start");
                stop_later(worker)
            });

        run(worker).await;
        let log = log.borrow();
        assert_eq!(log.first(), Some(&"start"));
        assert!(log.len() > 1);
    }

    #[tokio::test]
    async fn reload_signal_exits_with_reload_code() {
        let (reloads, on_reload) = counter();
        let worker = WorkerProcess::new("web").on_reload(on_reload).on_start(|worker| {
            if let Some(handle) = worker.event_loop() {
                handle.deliver_signal(Signal::SIGUSR2);
            }
            Ok(())
        });

        let (worker, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, RELOAD_EXIT_CODE);
        assert_eq!(reloads.get(), 1);
        assert_eq!(worker.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn stop_signal_runs_on_stop_once() {
        let (stops, on_stop) = counter();
        let worker = WorkerProcess::new("web").on_stop(on_stop).on_start(|worker| {
            if let Some(handle) = worker.event_loop() {
                handle.deliver_signal(Signal::SIGTERM);
                handle.deliver_signal(Signal::SIGTERM);
            }
            Ok(())
        });

        let (_, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, STOP_EXIT_CODE);
        assert_eq!(stops.get(), 1);
    }

    #[tokio::test]
    async fn first_stop_wins() {
        let (stops, on_stop) = counter();
        let (reloads, on_reload) = counter();
        let worker = WorkerProcess::new("web")
            .on_stop(on_stop)
            .on_reload(on_reload)
            .on_start(|worker| {
                worker.stop(3);
                worker.stop(5);
                worker.reload();
                Ok(())
            });

        let (_, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, 3);
        assert_eq!(stops.get(), 1);
        assert_eq!(reloads.get(), 0);
    }

    #[tokio::test]
    async fn failing_stop_hook_still_stops_the_loop() {
        let handled = Rc::new(Cell::new(0));
        let handler_count = Rc::clone(&handled);
        let worker = WorkerProcess::new("web")
            .on_stop(|_| Err(generic_error!("cleanup failed")))
            .with_error_handler(move |_, _| handler_count.set(handler_count.get() + 1))
            .on_start(|worker| {
                worker.stop(2);
                Ok(())
            });

        let (_, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, 2);
        assert_eq!(handled.get(), 1);
    }

    #[tokio::test]
    async fn application_errors_feed_reload_strategies() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handler_seen = Rc::clone(&seen);
        let worker = WorkerProcess::new("web")
            .with_reload_strategies([
                Box::new(ExceptionReloadStrategy::new().with_threshold(2)) as Box<dyn ReloadStrategy>
            ])
            .with_error_handler(move |_, e| handler_seen.borrow_mut().push(e.to_string()))
            .on_start(|worker| {
                if let Some(handle) = worker.event_loop() {
                    handle.defer(|_| Err(generic_error!("first")));
                    handle.report_error(generic_error!("second"));
                }
                Ok(())
            });

        let (_, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, RELOAD_EXIT_CODE);
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn detach_is_the_last_message() {
        let (stops, on_stop) = counter();
        let worker = WorkerProcess::new("web").on_stop(on_stop).on_start(|worker| {
            worker.detach();
            assert!(worker.event_loop().is_none());
            assert!(worker.traffic_status().is_none());

            // Nothing is published or stopped once detached.
            worker.publish_heartbeat();
            worker.stop(9);
            Ok(())
        });

        let (worker, exit_code, messages) = run(worker).await;
        assert_eq!(exit_code, STOP_EXIT_CODE);
        assert_eq!(stops.get(), 0);
        assert_eq!(messages.first().map(Message::kind), Some("spawn"));
        assert_eq!(messages.last().map(Message::kind), Some("detach"));
        assert_eq!(worker.state(), LifecycleState::Terminated);
    }

    struct CountingService {
        requests: u64,
        stopped: Rc<Cell<bool>>,
        task: Option<JoinHandle<()>>,
    }

    impl Service for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        fn start(&mut self, context: ServiceContext) -> Result<(), GenericError> {
            let requests = self.requests;
            self.task = Some(spawn_local(async move {
                for _ in 0..requests {
                    sleep(Duration::from_millis(10)).await;
                    context.traffic().increment_packages();
                    context.reload_events().request();
                }
            }));
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped.set(true);
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn services_report_requests_to_reload_strategies() {
        let stopped = Rc::new(Cell::new(false));
        let mut worker = WorkerProcess::new("web").with_reload_strategies([
            Box::new(MaxRequestsReloadStrategy::new(5, 0)) as Box<dyn ReloadStrategy>
        ]);
        worker
            .start_service(CountingService {
                requests: 100,
                stopped: Rc::clone(&stopped),
                task: None,
            })
            .unwrap();

        let (worker, exit_code, _) = run(worker).await;
        assert_eq!(exit_code, RELOAD_EXIT_CODE);
        assert!(stopped.get());
        assert_eq!(worker.traffic_status().map(TrafficStatus::packages), Some(5));
    }
}
