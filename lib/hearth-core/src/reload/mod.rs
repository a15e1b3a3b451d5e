//! Reload strategies.
//!
//! A reload strategy is a rule that decides, from what happens inside a worker at runtime, that the worker should
//! gracefully restart itself. The [`ReloadStrategyTrigger`] owns a worker's strategies, feeds them the events they are
//! interested in, and asks the worker to reload when any of them is satisfied.

use std::time::Duration;

use bitmask_enum::bitmask;
use tracing::{debug, info};

use crate::{
    error::GenericError,
    event_loop::{CallbackId, LoopHandle},
};

mod exception;
pub use self::exception::ExceptionReloadStrategy;

mod memory;
pub use self::memory::MaxMemoryReloadStrategy;

mod requests;
pub use self::requests::MaxRequestsReloadStrategy;

mod ttl;
pub use self::ttl::TtlReloadStrategy;

/// Runtime event sources a strategy can subscribe to.
///
/// This type is a bitmask, so a strategy can subscribe to several sources at once.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum EventSources {
    /// Errors raised by application callbacks and services.
    Exception,

    /// Completed requests.
    Request,
}

impl Default for EventSources {
    fn default() -> Self {
        Self::none()
    }
}

/// Timer schedule for a strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Schedule {
    /// Evaluate the strategy once, after the given duration.
    After(Duration),

    /// Evaluate the strategy every time the given period elapses.
    Every(Duration),
}

/// A runtime event presented to a strategy.
#[derive(Debug)]
pub enum ReloadEvent<'a> {
    /// An error was raised.
    Exception(&'a GenericError),

    /// A request was completed.
    Request,

    /// The timer of the strategy elapsed.
    Timer,
}

/// A rule deciding that a worker should reload.
pub trait ReloadStrategy {
    /// Returns the name of the strategy, for logging.
    fn name(&self) -> &'static str;

    /// Returns the event sources this strategy is evaluated against.
    fn interests(&self) -> EventSources {
        EventSources::none()
    }

    /// Returns the timer schedule this strategy is evaluated on, if any.
    fn schedule(&self) -> Option<Schedule> {
        None
    }

    /// Evaluates the strategy against an event, returning `true` if the worker should reload.
    ///
    /// Only called with events coming from a subscribed source, or with [`ReloadEvent::Timer`] if the strategy has a
    /// schedule.
    fn should_reload(&mut self, event: &ReloadEvent<'_>) -> bool;
}

/// The context a [`ReloadStrategyTrigger`] drives.
pub trait ReloadTarget: Sized + 'static {
    /// Returns the trigger owned by this context, if it currently has one.
    fn reload_trigger_mut(&mut self) -> Option<&mut ReloadStrategyTrigger<Self>>;

    /// Gracefully reloads.
    fn reload(&mut self);
}

/// Evaluates reload strategies and reloads the owning context when any of them is satisfied.
///
/// The trigger is a level-triggered OR over all of its strategies: every strategy interested in an event sees it, and
/// if at least one of them is satisfied, a reload is requested. Reloads are requested by deferring a call to
/// [`ReloadTarget::reload`] on the owning event loop, so strategies are never evaluated re-entrantly with a reload.
/// Firings are not deduplicated, as reloading is idempotent.
pub struct ReloadStrategyTrigger<C> {
    loop_handle: LoopHandle<C>,
    strategies: Vec<Box<dyn ReloadStrategy>>,
    timers: Vec<CallbackId>,
    firings: usize,
}

impl<C: ReloadTarget> ReloadStrategyTrigger<C> {
    /// Creates a new `ReloadStrategyTrigger` bound to the given event loop.
    pub fn new(loop_handle: LoopHandle<C>) -> Self {
        Self {
            loop_handle,
            strategies: Vec::new(),
            timers: Vec::new(),
            firings: 0,
        }
    }

    /// Adds reload strategies.
    ///
    /// Strategies with a schedule have their timers registered with the event loop immediately.
    pub fn add_reload_strategies<I>(&mut self, strategies: I)
    where
        I: IntoIterator<Item = Box<dyn ReloadStrategy>>,
    {
        for strategy in strategies {
            let index = self.strategies.len();

            if let Some(schedule) = strategy.schedule() {
                let id = match schedule {
                    Schedule::After(delay) => self.loop_handle.delay(delay, move |context: &mut C| {
                        on_strategy_timer(context, index);
                        Ok(())
                    }),
                    Schedule::Every(period) => self.loop_handle.repeat(period, move |context: &mut C| {
                        on_strategy_timer(context, index);
                        Ok(())
                    }),
                };
                self.timers.push(id);
            }

            debug!(strategy = strategy.name(), interests = ?strategy.interests(), "Added reload strategy.");
            self.strategies.push(strategy);
        }
    }

    /// Presents an error to all strategies interested in exceptions.
    pub fn emit_exception(&mut self, error: &GenericError) {
        self.dispatch(EventSources::Exception, &ReloadEvent::Exception(error));
    }

    /// Presents a completed request to all strategies interested in requests.
    pub fn emit_request(&mut self) {
        self.dispatch(EventSources::Request, &ReloadEvent::Request);
    }

    /// Returns the number of strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns `true` if there are no strategies.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Returns the number of times a reload was requested.
    pub fn firings(&self) -> usize {
        self.firings
    }

    /// Cancels the timers of all scheduled strategies.
    pub fn cancel_timers(&mut self) {
        for id in self.timers.drain(..) {
            self.loop_handle.cancel(id);
        }
    }

    fn dispatch(&mut self, source: EventSources, event: &ReloadEvent<'_>) {
        let mut satisfied = None;
        for strategy in &mut self.strategies {
            if strategy.interests().contains(source) && strategy.should_reload(event) {
                satisfied.get_or_insert(strategy.name());
            }
        }

        if let Some(strategy) = satisfied {
            self.fire(strategy);
        }
    }

    fn on_timer(&mut self, index: usize) {
        let Some(strategy) = self.strategies.get_mut(index) else {
            return;
        };

        if strategy.should_reload(&ReloadEvent::Timer) {
            let name = strategy.name();
            self.fire(name);
        }
    }

    fn fire(&mut self, strategy: &'static str) {
        info!(strategy, "Reload strategy triggered. Reloading worker.");
        self.firings += 1;
        self.loop_handle.defer(|context: &mut C| {
            context.reload();
            Ok(())
        });
    }
}

fn on_strategy_timer<C: ReloadTarget>(context: &mut C, index: usize) {
    if let Some(trigger) = context.reload_trigger_mut() {
        trigger.on_timer(index);
    }
}

/// A handle for feeding runtime events to a trigger from outside of loop callbacks.
///
/// Events are delivered to the trigger on the next iteration of the event loop.
pub struct ReloadEvents<C> {
    loop_handle: LoopHandle<C>,
}

impl<C> Clone for ReloadEvents<C> {
    fn clone(&self) -> Self {
        Self {
            loop_handle: self.loop_handle.clone(),
        }
    }
}

impl<C: ReloadTarget> ReloadEvents<C> {
    /// Creates a new `ReloadEvents` for the trigger of the context driven by the given event loop.
    pub fn new(loop_handle: LoopHandle<C>) -> Self {
        Self { loop_handle }
    }

    /// Reports a completed request.
    pub fn request(&self) {
        self.loop_handle.defer(|context: &mut C| {
            if let Some(trigger) = context.reload_trigger_mut() {
                trigger.emit_request();
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::{event_loop::EventLoop, generic_error};

    struct Target {
        trigger: Option<ReloadStrategyTrigger<Target>>,
        loop_handle: LoopHandle<Target>,
        reloads: Vec<Instant>,
    }

    impl Target {
        fn new(event_loop: &EventLoop<Target>) -> Self {
            Self {
                trigger: Some(ReloadStrategyTrigger::new(event_loop.handle())),
                loop_handle: event_loop.handle(),
                reloads: Vec::new(),
            }
        }

        fn trigger(&mut self) -> &mut ReloadStrategyTrigger<Target> {
            self.trigger.as_mut().unwrap()
        }
    }

    impl ReloadTarget for Target {
        fn reload_trigger_mut(&mut self) -> Option<&mut ReloadStrategyTrigger<Self>> {
            self.trigger.as_mut()
        }

        fn reload(&mut self) {
            self.reloads.push(Instant::now());
            self.loop_handle.stop();
        }
    }

    fn boxed<S: ReloadStrategy + 'static>(strategy: S) -> Box<dyn ReloadStrategy> {
        Box::new(strategy)
    }

    struct Always;

    impl ReloadStrategy for Always {
        fn name(&self) -> &'static str {
            "always"
        }

        fn interests(&self) -> EventSources {
            EventSources::Request
        }

        fn should_reload(&mut self, _event: &ReloadEvent<'_>) -> bool {
            true
        }
    }

    #[test]
    fn exception_threshold_fires_exactly_once() {
        let event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        let trigger = target.trigger();
        trigger.add_reload_strategies([boxed(ExceptionReloadStrategy::new().with_threshold(3))]);

        let error = generic_error!("boom");
        trigger.emit_exception(&error);
        trigger.emit_exception(&error);
        assert_eq!(trigger.firings(), 0);

        trigger.emit_exception(&error);
        assert_eq!(trigger.firings(), 1);

        trigger.emit_exception(&error);
        trigger.emit_exception(&error);
        assert_eq!(trigger.firings(), 1);
    }

    #[test]
    fn events_only_reach_interested_strategies() {
        let event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        let trigger = target.trigger();
        trigger.add_reload_strategies([boxed(Always)]);

        trigger.emit_exception(&generic_error!("ignored"));
        assert_eq!(trigger.firings(), 0);

        trigger.emit_request();
        assert_eq!(trigger.firings(), 1);
    }

    #[test]
    fn satisfied_strategies_fire_once_per_event() {
        let event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        let trigger = target.trigger();
        trigger.add_reload_strategies([boxed(Always), boxed(Always)]);
        assert_eq!(trigger.len(), 2);

        trigger.emit_request();
        assert_eq!(trigger.firings(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_strategy_reloads_after_time_to_live() {
        let mut event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        target
            .trigger()
            .add_reload_strategies([boxed(TtlReloadStrategy::new(Duration::from_secs(30)))]);

        let started = Instant::now();
        event_loop.run(&mut target).await;

        assert_eq!(target.reloads.len(), 1);
        assert!(target.reloads[0] - started >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_reported_from_outside_the_loop_reach_the_trigger() {
        let mut event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        target
            .trigger()
            .add_reload_strategies([boxed(MaxRequestsReloadStrategy::new(2, 0))]);

        let events = ReloadEvents::new(event_loop.handle());
        events.request();
        events.request();

        event_loop.run(&mut target).await;
        assert_eq!(target.reloads.len(), 1);
        assert_eq!(target.trigger().firings(), 1);
    }

    #[test]
    fn cancelled_timers_are_removed_from_the_loop() {
        let event_loop = EventLoop::<Target>::new();
        let mut target = Target::new(&event_loop);
        target
            .trigger()
            .add_reload_strategies([boxed(TtlReloadStrategy::new(Duration::from_secs(1)))]);
        assert_eq!(event_loop.handle().identifiers().len(), 1);

        target.trigger().cancel_timers();
        assert!(event_loop.handle().identifiers().is_empty());
    }
}
