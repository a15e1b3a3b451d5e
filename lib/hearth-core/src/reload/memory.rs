use std::time::Duration;

use bytesize::ByteSize;
use tracing::debug;

use super::{EventSources, ReloadEvent, ReloadStrategy, Schedule};
use crate::memory::{MemoryProbe, Querier};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Reloads the worker once its resident memory exceeds a limit.
///
/// Memory is checked after every completed request, and periodically in case the worker is idle.
pub struct MaxMemoryReloadStrategy {
    limit: ByteSize,
    check_interval: Duration,
    probe: Box<dyn MemoryProbe>,
}

impl MaxMemoryReloadStrategy {
    /// Creates a new `MaxMemoryReloadStrategy` with the given limit, probing the memory of the current process.
    pub fn new(limit: ByteSize) -> Self {
        Self {
            limit,
            check_interval: DEFAULT_CHECK_INTERVAL,
            probe: Box::new(Querier::new()),
        }
    }

    /// Sets the interval at which memory is checked independently of requests.
    ///
    /// Defaults to 5 seconds.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Sets the probe used to read resident memory.
    pub fn with_probe<P>(mut self, probe: P) -> Self
    where
        P: MemoryProbe + 'static,
    {
        self.probe = Box::new(probe);
        self
    }
}

impl ReloadStrategy for MaxMemoryReloadStrategy {
    fn name(&self) -> &'static str {
        "max_memory"
    }

    fn interests(&self) -> EventSources {
        EventSources::Request
    }

    fn schedule(&self) -> Option<Schedule> {
        Some(Schedule::Every(self.check_interval))
    }

    fn should_reload(&mut self, _event: &ReloadEvent<'_>) -> bool {
        match self.probe.resident_set_size() {
            Some(rss) if rss > self.limit.as_u64() => {
                debug!(rss, limit = self.limit.as_u64(), "Resident memory over limit.");
                true
            }
            _ => false,
        }
    }
}
