//! Single-threaded event loop.
//!
//! The event loop is the capability each worker process runs its application logic on: deferred callbacks, one-shot
//! and repeating timers, and signal subscriptions, all cancelable by identifier. Time and I/O are driven by the Tokio
//! runtime the loop runs on, while callbacks themselves are executed sequentially by the loop, with mutable access to
//! a shared context value (the owning worker, in practice).
//!
//! Timer and signal sources are small Tokio tasks that do nothing but forward the identifier of the registration that
//! became ready. The loop then takes the callback out of its registry, runs it to completion, and puts it back if the
//! registration is still alive. This means callbacks are free to register, cancel, or stop the loop from within
//! themselves through a [`LoopHandle`].

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    rc::Rc,
    time::Duration,
};

use nix::sys::signal::Signal;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};

use crate::error::GenericError;

/// A loop callback.
pub type Callback<C> = Box<dyn FnMut(&mut C) -> Result<(), GenericError>>;

/// A loop error handler.
pub type ErrorHandler<C> = Box<dyn FnMut(&mut C, GenericError)>;

/// Identifier of a callback registered with the event loop.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    Deferred,
    Delay(Duration),
    Repeat(Duration),
    Signal(Signal),
}

impl Source {
    const fn is_one_shot(&self) -> bool {
        matches!(self, Self::Deferred | Self::Delay(_))
    }
}

struct Registration<C> {
    source: Source,

    // Taken out while the callback is executing.
    callback: Option<Callback<C>>,
    task: Option<JoinHandle<()>>,
}

enum LoopEvent {
    Fired(CallbackId),
    Signal(Signal),
    Error(GenericError),
    Wake,
}

struct Shared<C> {
    next_id: u64,
    registrations: BTreeMap<CallbackId, Registration<C>>,
    deferred: VecDeque<CallbackId>,
    unarmed: Vec<CallbackId>,
    signal_listeners: HashMap<Signal, JoinHandle<()>>,
    error_handler: Option<ErrorHandler<C>>,
    running: bool,
    stopped: bool,
}

impl<C> Shared<C> {
    fn register(&mut self, source: Source, callback: Callback<C>) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;

        self.registrations.insert(
            id,
            Registration {
                source,
                callback: Some(callback),
                task: None,
            },
        );

        match source {
            Source::Deferred => self.deferred.push_back(id),
            _ => self.unarmed.push(id),
        }

        id
    }

    fn abort_all_tasks(&mut self) {
        for registration in self.registrations.values_mut() {
            if let Some(task) = registration.task.take() {
                task.abort();
            }
        }

        for (_, listener) in self.signal_listeners.drain() {
            listener.abort();
        }
    }
}

/// A single-threaded event loop.
///
/// Callbacks are registered through a [`LoopHandle`], acquired with [`EventLoop::handle`], and are executed by
/// [`EventLoop::run`] until the loop is stopped.
pub struct EventLoop<C> {
    shared: Rc<RefCell<Shared<C>>>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl<C> EventLoop<C> {
    /// Creates a new, empty `EventLoop`.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            shared: Rc::new(RefCell::new(Shared {
                next_id: 0,
                registrations: BTreeMap::new(),
                deferred: VecDeque::new(),
                unarmed: Vec::new(),
                signal_listeners: HashMap::new(),
                error_handler: None,
                running: false,
                stopped: false,
            })),
            events_tx,
            events_rx,
        }
    }

    /// Returns a handle for registering callbacks with this loop.
    pub fn handle(&self) -> LoopHandle<C> {
        LoopHandle {
            shared: Rc::clone(&self.shared),
            events_tx: self.events_tx.clone(),
        }
    }

    /// Runs the loop until it is stopped.
    ///
    /// All pending deferred callbacks are executed before the loop waits on any timer or signal. Callbacks are given
    /// mutable access to `context`.
    ///
    /// Must be called from within a Tokio runtime, as timers and signal listeners are spawned as Tokio tasks.
    pub async fn run(&mut self, context: &mut C) {
        {
            let mut shared = self.shared.borrow_mut();
            shared.running = true;
            shared.stopped = false;
        }

        debug!("Event loop started.");

        loop {
            self.arm_pending();
            self.run_deferred(context);
            if self.is_stopped() {
                break;
            }

            // We hold a sender ourselves, so the channel can never be closed while we're waiting on it.
            let event = match self.events_rx.recv().await {
                Some(event) => event,
                None => break,
            };

            self.dispatch(event, context);
            if self.is_stopped() {
                break;
            }
        }

        self.shared.borrow_mut().running = false;
        debug!("Event loop stopped.");
    }

    fn is_stopped(&self) -> bool {
        self.shared.borrow().stopped
    }

    fn arm_pending(&mut self) {
        let mut shared = self.shared.borrow_mut();
        let unarmed = std::mem::take(&mut shared.unarmed);

        for id in unarmed {
            let source = match shared.registrations.get(&id) {
                Some(registration) => registration.source,
                // Cancelled before it was ever armed.
                None => continue,
            };

            let events_tx = self.events_tx.clone();
            let task = match source {
                Source::Deferred => None,
                Source::Delay(delay) => Some(tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = events_tx.send(LoopEvent::Fired(id));
                })),
                Source::Repeat(period) => Some(tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if events_tx.send(LoopEvent::Fired(id)).is_err() {
                            break;
                        }
                    }
                })),
                Source::Signal(sig) => {
                    if !shared.signal_listeners.contains_key(&sig) {
                        match spawn_signal_listener(sig, events_tx) {
                            Ok(listener) => {
                                shared.signal_listeners.insert(sig, listener);
                            }
                            Err(e) => {
                                warn!(signal = %sig, error = %e, "Failed to install OS signal listener. Signal can only be delivered internally.")
                            }
                        }
                    }
                    None
                }
            };

            if let Some(registration) = shared.registrations.get_mut(&id) {
                registration.task = task;
            }
        }
    }

    fn run_deferred(&mut self, context: &mut C) {
        loop {
            if self.is_stopped() {
                return;
            }

            let next = self.shared.borrow_mut().deferred.pop_front();
            match next {
                Some(id) => self.invoke(id, context),
                None => return,
            }
        }
    }

    fn dispatch(&mut self, event: LoopEvent, context: &mut C) {
        match event {
            LoopEvent::Fired(id) => self.invoke(id, context),
            LoopEvent::Signal(sig) => {
                let subscribers = self
                    .shared
                    .borrow()
                    .registrations
                    .iter()
                    .filter(|(_, registration)| registration.source == Source::Signal(sig))
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();

                debug!(signal = %sig, subscribers = subscribers.len(), "Dispatching signal.");

                for id in subscribers {
                    if self.is_stopped() {
                        break;
                    }
                    self.invoke(id, context);
                }
            }
            LoopEvent::Error(e) => self.handle_error(e, context),
            LoopEvent::Wake => {}
        }
    }

    fn invoke(&mut self, id: CallbackId, context: &mut C) {
        let taken = self
            .shared
            .borrow_mut()
            .registrations
            .get_mut(&id)
            .and_then(|registration| {
                let source = registration.source;
                registration.callback.take().map(|callback| (source, callback))
            });

        // Either cancelled, or a fired event that raced with a cancellation.
        let Some((source, mut callback)) = taken else {
            return;
        };

        let result = callback(context);

        {
            let mut shared = self.shared.borrow_mut();
            if source.is_one_shot() {
                shared.registrations.remove(&id);
            } else if let Some(registration) = shared.registrations.get_mut(&id) {
                registration.callback = Some(callback);
            }
        }

        if let Err(e) = result {
            self.handle_error(e, context);
        }
    }

    fn handle_error(&mut self, e: GenericError, context: &mut C) {
        let handler = self.shared.borrow_mut().error_handler.take();
        match handler {
            Some(mut handler) => {
                handler(context, e);

                // Only restore the handler if a new one wasn't installed while it was executing.
                let mut shared = self.shared.borrow_mut();
                if shared.error_handler.is_none() {
                    shared.error_handler = Some(handler);
                }
            }
            None => error!(error = %e, "Unhandled error raised in event loop callback."),
        }
    }
}

impl<C> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Drop for EventLoop<C> {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            shared.abort_all_tasks();
        }
    }
}

fn spawn_signal_listener(
    sig: Signal, events_tx: mpsc::UnboundedSender<LoopEvent>,
) -> std::io::Result<JoinHandle<()>> {
    let mut listener = signal(SignalKind::from_raw(sig as i32))?;
    Ok(tokio::spawn(async move {
        while listener.recv().await.is_some() {
            if events_tx.send(LoopEvent::Signal(sig)).is_err() {
                break;
            }
        }
    }))
}

/// A handle to an [`EventLoop`].
///
/// Handles are cheap to clone, and every registration made through them is tied to the loop they were acquired from.
pub struct LoopHandle<C> {
    shared: Rc<RefCell<Shared<C>>>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
}

impl<C> Clone for LoopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<C> LoopHandle<C> {
    fn register(&self, source: Source, callback: Callback<C>) -> CallbackId {
        let id = self.shared.borrow_mut().register(source, callback);
        self.wake();
        id
    }

    fn wake(&self) {
        let _ = self.events_tx.send(LoopEvent::Wake);
    }

    /// Defers the execution of a callback until the next iteration of the loop.
    pub fn defer<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce(&mut C) -> Result<(), GenericError> + 'static,
    {
        self.register(Source::Deferred, once(callback))
    }

    /// Executes a callback once, after the given delay has elapsed.
    pub fn delay<F>(&self, delay: Duration, callback: F) -> CallbackId
    where
        F: FnOnce(&mut C) -> Result<(), GenericError> + 'static,
    {
        self.register(Source::Delay(delay), once(callback))
    }

    /// Executes a callback every `period`, starting one period from when the loop arms the timer.
    pub fn repeat<F>(&self, period: Duration, callback: F) -> CallbackId
    where
        F: FnMut(&mut C) -> Result<(), GenericError> + 'static,
    {
        self.register(Source::Repeat(period), Box::new(callback))
    }

    /// Executes a callback every time the given signal is received.
    ///
    /// The signal is listened for at the OS level and can additionally be delivered internally with
    /// [`deliver_signal`][Self::deliver_signal].
    pub fn on_signal<F>(&self, sig: Signal, callback: F) -> CallbackId
    where
        F: FnMut(&mut C) -> Result<(), GenericError> + 'static,
    {
        self.register(Source::Signal(sig), Box::new(callback))
    }

    /// Cancels a registered callback.
    ///
    /// Cancelling an unknown or already-cancelled identifier is a no-op.
    pub fn cancel(&self, id: CallbackId) {
        let removed = self.shared.borrow_mut().registrations.remove(&id);
        if let Some(task) = removed.and_then(|registration| registration.task) {
            task.abort();
        }
    }

    /// Returns the identifiers of all registered callbacks.
    pub fn identifiers(&self) -> Vec<CallbackId> {
        self.shared.borrow().registrations.keys().copied().collect()
    }

    /// Installs the error handler for errors returned by callbacks or reported with
    /// [`report_error`][Self::report_error].
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: FnMut(&mut C, GenericError) + 'static,
    {
        self.shared.borrow_mut().error_handler = Some(Box::new(handler));
    }

    /// Stops the loop.
    ///
    /// The loop returns from [`EventLoop::run`] once the currently executing callback, if any, returns.
    pub fn stop(&self) {
        self.shared.borrow_mut().stopped = true;
        self.wake();
    }

    /// Returns `true` if the loop is currently running and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        let shared = self.shared.borrow();
        shared.running && !shared.stopped
    }

    /// Delivers a signal to the loop without going through the OS.
    pub fn deliver_signal(&self, sig: Signal) {
        let _ = self.events_tx.send(LoopEvent::Signal(sig));
    }

    /// Reports an error to the loop's error handler.
    ///
    /// This is the way for code running outside of loop callbacks, such as tasks spawned by a service, to surface
    /// application errors.
    pub fn report_error(&self, error: GenericError) {
        let _ = self.events_tx.send(LoopEvent::Error(error));
    }
}

fn once<C, F>(callback: F) -> Callback<C>
where
    F: FnOnce(&mut C) -> Result<(), GenericError> + 'static,
{
    let mut callback = Some(callback);
    Box::new(move |context| match callback.take() {
        Some(callback) => callback(context),
        None => Ok(()),
    })
}
