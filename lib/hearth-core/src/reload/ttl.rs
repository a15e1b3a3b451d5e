use std::time::Duration;

use super::{ReloadEvent, ReloadStrategy, Schedule};

/// Reloads the worker once it has been running for a given time.
pub struct TtlReloadStrategy {
    ttl: Duration,
}

impl TtlReloadStrategy {
    /// Creates a new `TtlReloadStrategy`.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl ReloadStrategy for TtlReloadStrategy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn schedule(&self) -> Option<Schedule> {
        Some(Schedule::After(self.ttl))
    }

    fn should_reload(&mut self, event: &ReloadEvent<'_>) -> bool {
        matches!(event, ReloadEvent::Timer)
    }
}
