use crate::{error::GenericError, event_loop::LoopHandle, reload::ReloadEvents, traffic::TrafficStatus};

use super::WorkerProcess;

/// An application service run by a worker, such as a network server.
///
/// Services are started once the worker is running, and are stopped before the worker stops, reloads, or detaches.
/// Work that outlives [`start`][Service::start] is expected to be spawned on the worker's event loop or as local Tokio
/// tasks, and to report completed requests and errors through the [`ServiceContext`].
pub trait Service {
    /// Returns the name of the service.
    fn name(&self) -> &str;

    /// Starts the service.
    ///
    /// # Errors
    ///
    /// If the service fails to start, an error is returned, and is handled like any other application error.
    fn start(&mut self, context: ServiceContext) -> Result<(), GenericError>;

    /// Stops the service.
    fn stop(&mut self) {}
}

/// Worker resources available to a [`Service`].
#[derive(Clone)]
pub struct ServiceContext {
    loop_handle: LoopHandle<WorkerProcess>,
    traffic: TrafficStatus,
    reload_events: ReloadEvents<WorkerProcess>,
}

impl ServiceContext {
    pub(super) fn new(loop_handle: LoopHandle<WorkerProcess>, traffic: TrafficStatus) -> Self {
        let reload_events = ReloadEvents::new(loop_handle.clone());
        Self {
            loop_handle,
            traffic,
            reload_events,
        }
    }

    /// Returns the event loop of the worker.
    pub fn loop_handle(&self) -> &LoopHandle<WorkerProcess> {
        &self.loop_handle
    }

    /// Returns the traffic counters of the worker.
    pub fn traffic(&self) -> &TrafficStatus {
        &self.traffic
    }

    /// Returns the handle for reporting completed requests to the reload strategies of the worker.
    pub fn reload_events(&self) -> &ReloadEvents<WorkerProcess> {
        &self.reload_events
    }
}
