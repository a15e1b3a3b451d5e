//! Restart throttling for crashed worker processes.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;
use tracing::debug;

/// Restart policy for crashed worker processes.
///
/// Defaults to a restart intensity of 5 over a period of 10 seconds.
///
/// # Throttling
///
/// Up to `intensity` restarts, across all worker processes, are allowed immediately over a given `period`. Once this
/// limit is reached, further restarts are delayed until the oldest restart in the window falls outside of the period.
/// The master never gives up on a worker slot: a worker that crashes on every start is restarted at a bounded rate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartPolicy {
    intensity: usize,
    period: Duration,
}

impl RestartPolicy {
    /// Creates a new `RestartPolicy` with the given intensity and period.
    pub const fn new(intensity: usize, period: Duration) -> Self {
        Self { intensity, period }
    }

    /// Returns the number of restarts allowed immediately within a period.
    pub const fn intensity(&self) -> usize {
        self.intensity
    }

    /// Returns the period over which restarts are counted.
    pub const fn period(&self) -> Duration {
        self.period
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }
}

/// Action to take for a crashed worker process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartAction {
    /// Restart the process now.
    Restart,

    /// Restart the process after the given delay.
    Delay(Duration),
}

/// Tracks recent restarts against a [`RestartPolicy`].
#[derive(Debug)]
pub struct RestartState {
    policy: RestartPolicy,
    restart_history: VecDeque<Instant>,
}

impl RestartState {
    /// Creates a new `RestartState` with the given policy.
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restart_history: VecDeque::with_capacity(policy.intensity),
        }
    }

    /// Evaluates a restart, recording it in the restart history.
    ///
    /// Delayed restarts are recorded at the time they will happen, so that a burst of crashes is spread out over
    /// consecutive periods instead of being released all at once.
    pub fn evaluate_restart(&mut self) -> RestartAction {
        let now = Instant::now();

        // An intensity of zero spaces every restart a full period apart.
        if self.policy.intensity == 0 {
            let at = self
                .restart_history
                .back()
                .map_or(now, |last| (*last + self.policy.period).max(now));
            self.restart_history.clear();
            self.restart_history.push_back(at);
            return action_at(now, at);
        }

        // Only the last `intensity` restarts are tracked, so the oldest one tells us whether the window is full.
        let mut at = now;
        if self.restart_history.len() == self.policy.intensity {
            if let Some(oldest) = self.restart_history.pop_front() {
                at = (oldest + self.policy.period).max(now);
            }
        }

        self.restart_history.push_back(at);

        let action = action_at(now, at);
        if let RestartAction::Delay(delay) = action {
            debug!(
                "Restart limit reached ({} in {:?}), delaying restart by {:?}.",
                self.policy.intensity, self.policy.period, delay
            );
        }
        action
    }
}

fn action_at(now: Instant, at: Instant) -> RestartAction {
    if at <= now {
        RestartAction::Restart
    } else {
        RestartAction::Delay(at - now)
    }
}
