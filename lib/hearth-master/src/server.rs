use std::io;

use hearth_core::{
    error::WorkerError,
    ipc::{IpcError, IpcPublisher, WORKER_INDEX_ENV, WORKER_NAME_ENV},
    WorkerProcess,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    config::MasterConfiguration,
    master::{Master, MasterError, WorkerPool},
    spawn::WorkerCommand,
};

/// Server errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ServerError {
    /// The worker process was started for a pool that is not defined.
    #[snafu(display("No worker named '{}' is defined.", name))]
    UnknownWorker {
        /// Name of the worker pool.
        name: String,
    },

    /// The worker process was started with an invalid index.
    #[snafu(display("Invalid worker index '{}'.", value))]
    InvalidIndex {
        /// Raw value of the index.
        value: String,
    },

    /// The worker process could not connect to the master.
    #[snafu(display("Failed to connect to master process: {}", source))]
    Ipc {
        /// Underlying IPC error.
        source: IpcError,
    },

    /// The worker failed to run.
    #[snafu(display("Worker failed: {}", source))]
    WorkerFailed {
        /// Underlying worker error.
        source: WorkerError,
    },

    /// The master failed to run.
    #[snafu(display("Master failed: {}", source))]
    MasterFailed {
        /// Underlying master error.
        source: MasterError,
    },

    /// The master runtime could not be built.
    #[snafu(display("Failed to build master runtime: {}", source))]
    Runtime {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The current executable could not be determined.
    #[snafu(display("Failed to determine the current executable: {}", source))]
    CurrentExe {
        /// Underlying I/O error.
        source: io::Error,
    },
}

type WorkerFactory = Box<dyn Fn() -> WorkerProcess>;

struct WorkerDefinition {
    pool: WorkerPool,
    factory: WorkerFactory,
}

/// A server: a master process and the worker pools it supervises.
///
/// The same program runs as both the master and its workers. The master spawns workers by executing the current program
/// again with the worker's identity in its environment, and [`run`][Self::run] dispatches on that identity: if it is
/// present the process runs the matching worker, and otherwise it runs the master.
///
/// Workers are defined through factories building a [`WorkerProcess`]. The master calls each factory once to learn the
/// name, size, user, and reloadability of the pool, and every worker process calls the factory of its own pool.
pub struct Server {
    config: MasterConfiguration,
    command: Option<WorkerCommand>,
    workers: Vec<WorkerDefinition>,
}

impl Server {
    /// Creates a new `Server` with the given master configuration.
    pub fn new(config: MasterConfiguration) -> Self {
        Self {
            config,
            command: None,
            workers: Vec::new(),
        }
    }

    /// Sets the command used to spawn worker processes.
    ///
    /// Defaults to re-executing the current program with the same arguments.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Adds a worker pool, built by the given factory.
    pub fn add_worker<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> WorkerProcess + 'static,
    {
        let template = factory();
        let pool = WorkerPool {
            name: template.name().to_string(),
            count: template.count(),
            reloadable: template.is_reloadable(),
            user: template.user(),
        };

        debug!(worker_name = %pool.name, count = pool.count, "Adding worker pool.");
        self.workers.push(WorkerDefinition {
            pool,
            factory: Box::new(factory),
        });
        self
    }

    /// Returns the configured worker pools.
    pub fn pools(&self) -> Vec<WorkerPool> {
        self.workers.iter().map(|worker| worker.pool.clone()).collect()
    }

    /// Returns `true` if the current process was spawned as a worker.
    pub fn is_worker_process() -> bool {
        std::env::var_os(WORKER_NAME_ENV).is_some()
    }

    /// Runs the server, returning the exit code of the process.
    ///
    /// In a worker process, this runs the worker until it stops. Otherwise, this runs the master until it stops.
    ///
    /// # Errors
    ///
    /// If the worker or the master fails to run, an error is returned.
    pub fn run(self) -> Result<i32, ServerError> {
        match std::env::var(WORKER_NAME_ENV) {
            Ok(name) => {
                let index = std::env::var(WORKER_INDEX_ENV).ok();
                self.run_worker(&name, index.as_deref())
            }
            Err(_) => self.run_master().map(|()| 0),
        }
    }

    fn run_worker(&self, name: &str, index: Option<&str>) -> Result<i32, ServerError> {
        let definition = self
            .workers
            .iter()
            .find(|worker| worker.pool.name == name)
            .context(UnknownWorker { name })?;

        let index = match index {
            Some(value) => value.parse::<usize>().ok().context(InvalidIndex { value })?,
            None => 0,
        };

        let publisher = IpcPublisher::from_env().context(Ipc)?;
        let worker = (definition.factory)().with_index(index);
        worker.run(Box::new(publisher)).context(WorkerFailed)
    }

    fn run_master(self) -> Result<(), ServerError> {
        let command = match self.command {
            Some(command) => command,
            None => WorkerCommand::current_exe().context(CurrentExe)?,
        };

        let pools = self.workers.into_iter().map(|worker| worker.pool).collect();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context(Runtime)?;

        let master = Master::new(self.config, command, pools);
        runtime.block_on(master.run()).context(MasterFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new(MasterConfiguration::default())
            .add_worker(|| WorkerProcess::new("web").with_count(4))
            .add_worker(|| {
                WorkerProcess::new("scheduler")
                    .with_reloadable(false)
                    .with_user("nobody")
            })
    }

    #[test]
    fn pools_are_read_from_worker_factories() {
        let pools = server().pools();
        assert_eq!(pools.len(), 2);

        assert_eq!(pools[0].name, "web");
        assert_eq!(pools[0].count, 4);
        assert!(pools[0].reloadable);

        assert_eq!(pools[1].name, "scheduler");
        assert_eq!(pools[1].count, 1);
        assert!(!pools[1].reloadable);
        assert_eq!(pools[1].user, "nobody");
    }

    #[test]
    fn workers_must_be_defined() {
        let result = server().run_worker("mailer", Some("0"));
        assert!(matches!(result, Err(ServerError::UnknownWorker { name }) if name == "mailer"));

        let result = server().run_worker("web", Some("first"));
        assert!(matches!(result, Err(ServerError::InvalidIndex { value }) if value == "first"));
    }

    #[test]
    fn workers_need_an_ipc_channel() {
        let result = server().run_worker("web", Some("1"));
        assert!(matches!(
            result,
            Err(ServerError::Ipc {
                source: IpcError::MissingDescriptor { .. }
            })
        ));
    }
}
