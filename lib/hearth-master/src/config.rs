//! Master process configuration.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::restart::RestartPolicy;

const fn default_shutdown_timeout_secs() -> u64 {
    10
}

const fn default_status_interval_secs() -> u64 {
    1
}

const fn default_restart_intensity() -> usize {
    5
}

const fn default_restart_period_secs() -> u64 {
    10
}

/// Master process configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct MasterConfiguration {
    /// Seconds to wait for workers to exit after being asked to stop, before they are killed.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Path of the JSON file the server status is written to.
    ///
    /// No file is written by default.
    #[serde(default)]
    pub status_file: Option<PathBuf>,

    /// Seconds between writes of the status file.
    ///
    /// Defaults to 1 second.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// Number of crashed workers restarted immediately within `restart_period_secs`.
    ///
    /// Defaults to 5.
    #[serde(default = "default_restart_intensity")]
    pub restart_intensity: usize,

    /// Window, in seconds, over which worker restarts are counted.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_restart_period_secs")]
    pub restart_period_secs: u64,

    /// Seconds without a heartbeat after which a worker is reported as unresponsive.
    ///
    /// Defaults to 0, which disables the check.
    #[serde(default)]
    pub heartbeat_timeout_secs: u64,

    /// Path of the PID file of the master process.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl MasterConfiguration {
    /// Returns the shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the interval between status file writes.
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    /// Returns the heartbeat timeout, if enabled.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_secs > 0).then(|| Duration::from_secs(self.heartbeat_timeout_secs))
    }

    /// Returns the restart policy for crashed workers.
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::new(self.restart_intensity, Duration::from_secs(self.restart_period_secs))
    }
}

impl Default for MasterConfiguration {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            status_file: None,
            status_interval_secs: default_status_interval_secs(),
            restart_intensity: default_restart_intensity(),
            restart_period_secs: default_restart_period_secs(),
            heartbeat_timeout_secs: 0,
            pid_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use hearth_app::config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"shutdown_timeout_secs: 3\nstatus_file: /run/hearth/status.json\n")
            .unwrap();

        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed::<MasterConfiguration>()
            .unwrap();

        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.status_file, Some(PathBuf::from("/run/hearth/status.json")));
        assert_eq!(config.restart_policy(), RestartPolicy::default());
        assert_eq!(config.heartbeat_timeout(), None);
        assert_eq!(config.status_interval(), Duration::from_secs(1));
    }
}
