//! A process supervisor running pools of external commands.
//!
//! The same binary runs as the master, which spawns and supervises one process per worker, and as each of those worker
//! processes.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use hearth_app::{
    config::ConfigurationLoader,
    logging::{fatal_and_exit, flush_logging, initialize_logging},
};
use hearth_core::error::GenericError;
use hearth_master::Server;
use tracing::{error, info};

mod command;
use self::command::build_worker;

mod config;
use self::config::{Action, Cli, HearthConfiguration, RunConfig};

mod status;
use self::status::print_status;

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "hearth";

fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    let exit_code = match cli.action {
        Action::Run(config) => match run(config) {
            Ok(exit_code) => exit_code,
            Err(e) => {
                error!("{:?}", e);
                1
            }
        },
        Action::Status(config) => match print_status(config) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:?}", e);
                1
            }
        },
    };

    flush_logging();
    std::process::exit(exit_code);
}

fn run(config: RunConfig) -> Result<i32, GenericError> {
    let hearth_config = ConfigurationLoader::default()
        .from_yaml(&config.config)?
        .from_environment(ENV_PREFIX)?
        .into_typed::<HearthConfiguration>()?;
    hearth_config.validate()?;

    if !Server::is_worker_process() {
        info!(
            config = %config.config.display(),
            pools = hearth_config.workers.len(),
            "Starting master process."
        );
    }

    let mut server = Server::new(hearth_config.master);
    for pool in hearth_config.workers {
        server = server.add_worker(move || build_worker(&pool));
    }

    Ok(server.run()?)
}
