use rand::Rng as _;

use super::{EventSources, ReloadEvent, ReloadStrategy};

/// Reloads the worker after it has completed a number of requests.
///
/// The number of requests is the configured maximum plus a random amount up to the configured dispersion, chosen once
/// when the strategy is created. Dispersion keeps workers of the same group, which typically see the same traffic, from
/// all reloading at the same time.
pub struct MaxRequestsReloadStrategy {
    limit: u64,
    completed: u64,
}

impl MaxRequestsReloadStrategy {
    /// Creates a new `MaxRequestsReloadStrategy`.
    pub fn new(max_requests: u64, dispersion: u64) -> Self {
        let jitter = if dispersion == 0 {
            0
        } else {
            rand::rng().random_range(0..=dispersion)
        };

        Self {
            limit: max_requests.max(1).saturating_add(jitter),
            completed: 0,
        }
    }

    /// Returns the number of requests after which the worker is reloaded.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl ReloadStrategy for MaxRequestsReloadStrategy {
    fn name(&self) -> &'static str {
        "max_requests"
    }

    fn interests(&self) -> EventSources {
        EventSources::Request
    }

    fn should_reload(&mut self, event: &ReloadEvent<'_>) -> bool {
        if !matches!(event, ReloadEvent::Request) {
            return false;
        }

        self.completed = self.completed.saturating_add(1);
        self.completed == self.limit
    }
}
