use std::fmt;

use nix::sys::signal::Signal;

/// Exit code of a worker that stopped normally.
pub const STOP_EXIT_CODE: i32 = 0;

/// Exit code of a worker that stopped in order to be restarted.
pub const RELOAD_EXIT_CODE: i32 = 100;

/// Lifecycle state of a worker process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    /// Configured, but not yet running.
    Created,

    /// Setting up the event loop and announcing itself to the master.
    Initializing,

    /// Running the event loop.
    Running,

    /// Stopping in order to be restarted.
    StoppingForReload,

    /// Stopping for good.
    StoppingForExit,

    /// Handing the process over to an external program.
    Detaching,

    /// The event loop has stopped.
    Terminated,
}

impl LifecycleState {
    /// Returns `true` if the worker can still be stopped, reloaded, or detached.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::StoppingForReload => "stopping for reload",
            Self::StoppingForExit => "stopping for exit",
            Self::Detaching => "detaching",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A control request sent by the master to a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlEvent {
    /// Gracefully stop.
    Stop,

    /// Gracefully reload.
    Reload,
}

impl ControlEvent {
    /// Returns the signal that carries this control event.
    pub const fn signal(&self) -> Signal {
        match self {
            Self::Stop => Signal::SIGTERM,
            Self::Reload => Signal::SIGUSR2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_events_are_carried_by_distinct_signals() {
        assert_eq!(ControlEvent::Stop.signal(), Signal::SIGTERM);
        assert_eq!(ControlEvent::Reload.signal(), Signal::SIGUSR2);
    }
}
