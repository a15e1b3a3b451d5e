use std::{fmt::Write as _, path::Path};

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use hearth_app::{bootstrap::read_pid_file, config::ConfigurationLoader};
use hearth_core::{
    error::{ErrorContext as _, GenericError},
    generic_error,
};
use hearth_master::status::ServerStatus;
use nix::{sys::signal::kill, unistd::Pid};

use crate::config::{HearthConfiguration, StatusConfig};

/// Prints the status of a running server to standard output.
///
/// The status file is taken from the command line if given, and from the configuration file otherwise.
///
/// # Errors
///
/// If no status file is configured, or it cannot be read, an error is returned.
pub fn print_status(config: StatusConfig) -> Result<(), GenericError> {
    let (status_file, pid_file) = match config.status_file {
        Some(status_file) => (status_file, None),
        None => {
            let hearth_config = ConfigurationLoader::default()
                .from_yaml(&config.config)?
                .into_typed::<HearthConfiguration>()?;
            let status_file = hearth_config
                .master
                .status_file
                .ok_or_else(|| generic_error!("No status file is configured in '{}'.", config.config.display()))?;
            (status_file, hearth_config.master.pid_file)
        }
    };

    let status = ServerStatus::read_from_file(&status_file)
        .with_error_context(|| format!("Failed to read status file '{}'.", status_file.display()))?;
    let master_alive = pid_file.as_deref().map_or(true, is_process_alive);

    print!("{}", render_status(&status, master_alive, Utc::now()));
    Ok(())
}

fn is_process_alive(pid_file: &Path) -> bool {
    read_pid_file(pid_file)
        .and_then(|pid| i32::try_from(pid).ok())
        .is_some_and(|pid| kill(Pid::from_raw(pid), None).is_ok())
}

/// Renders the server, workers, and processes summaries of a server status as plain text.
pub fn render_status(status: &ServerStatus, master_alive: bool, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let running = status.running && master_alive;
    let traffic = status.total_traffic();

    let _ = writeln!(out, "Server");
    let _ = writeln!(out, "  status:       {}", if running { "running" } else { "stopped" });
    let _ = writeln!(out, "  started at:   {}", status.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if running {
        let _ = writeln!(out, "  uptime:       {}", format_uptime(now.signed_duration_since(status.started_at)));
    }
    let _ = writeln!(out, "  workers:      {}", status.workers_count());
    let _ = writeln!(out, "  processes:    {}", status.processes_count());
    let _ = writeln!(out, "  memory:       {}", ByteSize::b(status.total_memory()));
    let _ = writeln!(out, "  connections:  {}", traffic.connections);
    let _ = writeln!(out, "  requests:     {}", traffic.packages);
    let _ = writeln!(out, "  rx:           {}", ByteSize::b(traffic.rx));
    let _ = writeln!(out, "  tx:           {}", ByteSize::b(traffic.tx));

    let _ = writeln!(out);
    let _ = writeln!(out, "Workers");
    for worker in &status.workers {
        let _ = writeln!(out, "  {} user={} count={}", worker.name, worker.user, worker.count);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Processes");
    if status.processes.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for process in status.processes.values() {
        let _ = write!(
            out,
            "  {} {} user={} memory={}",
            process.pid,
            process.name,
            process.user.as_deref().unwrap_or("-"),
            ByteSize::b(process.memory)
        );
        if process.detached {
            let _ = write!(out, " detached");
        } else {
            let _ = write!(
                out,
                " connections={} requests={}",
                process.traffic.connections, process.traffic.packages
            );
        }
        let _ = writeln!(out);
    }

    out
}

fn format_uptime(uptime: chrono::Duration) -> String {
    let secs = uptime.num_seconds().max(0);
    let (days, hours, minutes, secs) = (secs / 86_400, (secs / 3_600) % 24, (secs / 60) % 60, secs % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
