use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use bytesize::ByteSize;
use clap::{ArgAction, Args, Parser, Subcommand};
use hearth_core::{error::GenericError, generic_error};
use hearth_master::config::MasterConfiguration;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Run the master process and its workers.
    #[command(name = "run")]
    Run(RunConfig),

    /// Print the status of a running server.
    #[command(name = "status")]
    Status(StatusConfig),
}

/// Run configuration.
#[derive(Args, Clone)]
pub struct RunConfig {
    /// Path to the configuration file.
    #[arg(short = 'c', long, default_value = "hearth.yaml")]
    pub config: PathBuf,
}

/// Status configuration.
#[derive(Args, Clone)]
pub struct StatusConfig {
    /// Path to the configuration file.
    ///
    /// Used to find the status file when it is not given explicitly.
    #[arg(short = 'c', long, default_value = "hearth.yaml")]
    pub config: PathBuf,

    /// Path to the status file.
    #[arg(short = 'f', long)]
    pub status_file: Option<PathBuf>,
}

const fn default_count() -> usize {
    1
}

const fn default_reloadable() -> bool {
    true
}

/// A worker pool running an external command.
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfiguration {
    /// Name of the pool.
    pub name: String,

    /// Number of worker processes.
    #[serde(default = "default_count")]
    pub count: usize,

    /// Whether the workers are reloaded when the server is reloaded.
    #[serde(default = "default_reloadable")]
    pub reloadable: bool,

    /// User the workers run as.
    #[serde(default)]
    pub user: Option<String>,

    /// Group the workers run as.
    #[serde(default)]
    pub group: Option<String>,

    /// Program to run.
    pub command: PathBuf,

    /// Arguments of the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables set for the program.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Whether workers replace themselves with the program, instead of running it as a child process.
    ///
    /// Reload strategies only apply to workers that run the program as a child process.
    #[serde(default)]
    pub exec: bool,

    /// Seconds after which a worker is reloaded.
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Resident memory of the program above which its worker is reloaded.
    #[serde(default)]
    pub max_memory: Option<ByteSize>,
}

impl PoolConfiguration {
    /// Returns the time to live of a worker, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}

/// Server configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HearthConfiguration {
    /// Master process configuration.
    #[serde(flatten)]
    pub master: MasterConfiguration,

    /// Worker pools.
    #[serde(default)]
    pub workers: Vec<PoolConfiguration>,
}

impl HearthConfiguration {
    /// Checks that the worker pools can be told apart.
    ///
    /// # Errors
    ///
    /// If a pool has an empty name, or two pools share a name, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        for (i, pool) in self.workers.iter().enumerate() {
            if pool.name.trim().is_empty() {
                return Err(generic_error!("Worker pool #{} has an empty name.", i));
            }

            if self.workers[..i].iter().any(|other| other.name == pool.name) {
                return Err(generic_error!("Worker pool name '{}' is used more than once.", pool.name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use hearth_app::config::ConfigurationLoader;

    use super::*;

    fn load(contents: &str) -> HearthConfiguration {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed()
            .unwrap()
    }

    #[test]
    fn pools_are_loaded_with_defaults() {
        let config = load(
            r#"
shutdown_timeout_secs: 5
workers:
  - name: web
    count: 4
    command: /usr/bin/php
    args: ["server.php"]
    ttl_secs: 3600
    max_memory: 256 MiB
  - name: cron
    reloadable: false
    command: /usr/sbin/crond
    exec: true
"#,
        );

        assert_eq!(config.master.shutdown_timeout_secs, 5);
        assert_eq!(config.workers.len(), 2);

        let web = &config.workers[0];
        assert_eq!(web.count, 4);
        assert!(web.reloadable);
        assert!(!web.exec);
        assert_eq!(web.ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(web.max_memory, Some(ByteSize::mib(256)));

        let cron = &config.workers[1];
        assert_eq!(cron.count, 1);
        assert!(!cron.reloadable);
        assert!(cron.exec);
        assert_eq!(cron.ttl(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_pool_names_are_rejected() {
        let config = load(
            r#"
workers:
  - name: web
    command: /bin/true
  - name: web
    command: /bin/false
"#,
        );
        assert!(config.validate().is_err());
    }
}
