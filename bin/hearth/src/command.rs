//! Workers running external commands.

use std::{
    cell::Cell,
    collections::BTreeMap,
    io,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    rc::Rc,
    thread::JoinHandle,
};
#[cfg(target_os = "linux")]
use std::os::unix::process::CommandExt as _;

use hearth_app::logging::flush_logging;
use hearth_core::{
    error::{ErrorContext as _, GenericError},
    ipc::{IPC_FD_ENV, WORKER_INDEX_ENV, WORKER_NAME_ENV},
    memory::{MemoryProbe as _, Querier},
    reload::{MaxMemoryReloadStrategy, ReloadStrategy, TtlReloadStrategy},
    worker::{Service, ServiceContext},
    WorkerProcess,
};
use nix::sys::signal::{kill, Signal};
use tokio::{sync::oneshot, task::spawn_local};
use tracing::{debug, info, warn};

use crate::config::PoolConfiguration;

/// Exit code of a worker whose command was terminated by a signal.
const SIGNALED_EXIT_CODE: i32 = 1;

/// An external program and how to run it.
#[derive(Clone, Debug)]
struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Builds the command for the program, without the worker's identity in its environment.
    ///
    /// On Linux, the program is killed when the thread that spawned it exits, which is the event loop thread of the
    /// worker. A worker killed by the master can then never leave its program running.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_remove(IPC_FD_ENV)
            .env_remove(WORKER_NAME_ENV)
            .env_remove(WORKER_INDEX_ENV)
            .envs(&self.env)
            .stdin(Stdio::null());

        #[cfg(target_os = "linux")]
        {
            let parent = nix::unistd::getpid();
            // SAFETY: `prctl`, `getppid`, and `kill` are async-signal-safe.
            unsafe {
                command.pre_exec(move || {
                    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
                    // The worker may have exited before the death signal was armed.
                    if nix::unistd::getppid() != parent {
                        let _ = kill(nix::unistd::getpid(), Signal::SIGKILL);
                    }
                    Ok(())
                });
            }
        }

        command
    }
}

/// Runs an external command as a child of the worker.
///
/// When the command exits on its own, the worker stops with the exit code of the command. When the worker stops or
/// reloads first, the command is sent `SIGTERM`, and the worker waits for it to exit.
struct CommandService {
    spec: CommandSpec,
    child_pid: Rc<Cell<Option<u32>>>,
    waiter: Option<JoinHandle<()>>,
}

impl Service for CommandService {
    fn name(&self) -> &str {
        "command"
    }

    fn start(&mut self, context: ServiceContext) -> Result<(), GenericError> {
        let mut child = self
            .spec
            .command()
            .spawn()
            .with_error_context(|| format!("Failed to start command '{}'.", self.spec.program.display()))?;

        let pid = child.id();
        self.child_pid.set(Some(pid));
        info!(program = %self.spec.program.display(), child_pid = pid, "Started command.");

        let (exit_tx, exit_rx) = oneshot::channel();
        let waiter = std::thread::Builder::new()
            .name("hearth-command-waiter".to_string())
            .spawn(move || {
                let _ = exit_tx.send(child.wait());
            })
            .error_context("Failed to spawn command waiter thread.")?;
        self.waiter = Some(waiter);

        let loop_handle = context.loop_handle().clone();
        let child_pid = Rc::clone(&self.child_pid);
        spawn_local(async move {
            let Ok(status) = exit_rx.await else {
                return;
            };

            child_pid.set(None);
            let code = exit_code(status);
            loop_handle.defer(move |worker| {
                info!(child_pid = pid, exit_code = code, "Command exited.");
                worker.stop(code);
                Ok(())
            });
        });

        Ok(())
    }

    fn stop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        if let Some(pid) = self.child_pid.take() {
            if !waiter.is_finished() {
                debug!(child_pid = pid, "Stopping command.");
                signal_child(pid, Signal::SIGTERM);
            }
        }

        if waiter.join().is_err() {
            warn!("Command waiter thread panicked.");
        }
    }
}

fn exit_code(status: io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().unwrap_or(SIGNALED_EXIT_CODE),
        Err(e) => {
            warn!(error = %e, "Failed to wait for command.");
            SIGNALED_EXIT_CODE
        }
    }
}

fn signal_child(pid: u32, signal: Signal) {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return;
    };

    if let Err(e) = kill(nix::unistd::Pid::from_raw(raw_pid), signal) {
        debug!(child_pid = pid, error = %e, "Failed to signal command.");
    }
}

/// Builds the worker of the given pool.
pub fn build_worker(pool: &PoolConfiguration) -> WorkerProcess {
    let mut worker = WorkerProcess::new(pool.name.clone())
        .with_count(pool.count)
        .with_reloadable(pool.reloadable);

    if let Some(user) = &pool.user {
        worker = worker.with_user(user.clone());
    }
    if let Some(group) = &pool.group {
        worker = worker.with_group(group.clone());
    }

    let spec = CommandSpec {
        program: pool.command.clone(),
        args: pool.args.clone(),
        env: pool.env.clone(),
    };

    if pool.exec {
        for (key, value) in &spec.env {
            worker = worker.with_env(key.clone(), value.clone());
        }
        return worker
            .with_exec_hook(flush_logging)
            .on_start(move |worker| worker.exec(&spec.program, &spec.args));
    }

    let child_pid = Rc::new(Cell::new(None));
    worker = worker.with_reload_strategies(reload_strategies(pool, &child_pid));
    worker.on_start(move |worker| {
        worker.start_service(CommandService {
            spec: spec.clone(),
            child_pid: Rc::clone(&child_pid),
            waiter: None,
        })
    })
}

fn reload_strategies(pool: &PoolConfiguration, child_pid: &Rc<Cell<Option<u32>>>) -> Vec<Box<dyn ReloadStrategy>> {
    let mut strategies: Vec<Box<dyn ReloadStrategy>> = Vec::new();

    if let Some(ttl) = pool.ttl() {
        strategies.push(Box::new(TtlReloadStrategy::new(ttl)));
    }

    if let Some(limit) = pool.max_memory {
        // The command does the work, so its memory is what counts.
        let child_pid = Rc::clone(child_pid);
        let probe = move || {
            child_pid
                .get()
                .and_then(|pid| Querier::for_process(pid).resident_set_size())
        };
        strategies.push(Box::new(MaxMemoryReloadStrategy::new(limit).with_probe(probe)));
    }

    strategies
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hearth_core::{
        ipc::ChannelPublisher,
        worker::{LifecycleState, RELOAD_EXIT_CODE},
    };

    use super::*;

    fn pool(command: &str, args: &[&str]) -> PoolConfiguration {
        PoolConfiguration {
            name: "web".to_string(),
            count: 2,
            reloadable: true,
            user: None,
            group: None,
            command: PathBuf::from(command),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: BTreeMap::new(),
            exec: false,
            ttl_secs: None,
            max_memory: None,
        }
    }

    async fn run(mut worker: WorkerProcess) -> (WorkerProcess, i32) {
        let (publisher, _rx) = ChannelPublisher::new();
        let exit_code = tokio::time::timeout(Duration::from_secs(20), worker.run_until_stopped(Box::new(publisher)))
            .await
            .unwrap()
            .unwrap();
        (worker, exit_code)
    }

    #[test]
    fn workers_are_built_from_pools() {
        let worker = build_worker(&PoolConfiguration {
            reloadable: false,
            user: Some("nobody".to_string()),
            ..pool("/bin/true", &[])
        });

        assert_eq!(worker.name(), "web");
        assert_eq!(worker.count(), 2);
        assert!(!worker.is_reloadable());
        assert_eq!(worker.user(), "nobody");
        assert_eq!(worker.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn command_exit_code_becomes_the_worker_exit_code() {
        let (_, exit_code) = run(build_worker(&pool("/bin/sh", &["-c", "exit 7"]))).await;
        assert_eq!(exit_code, 7);
    }

    #[tokio::test]
    async fn missing_commands_are_reported() {
        let worker = build_worker(&pool("/nonexistent/hearth-command", &[])).with_error_handler(|worker, e| {
            assert!(e.to_string().contains("Failed to start command"));
            worker.stop(3);
        });

        let (_, exit_code) = run(worker).await;
        assert_eq!(exit_code, 3);
    }

    #[tokio::test]
    async fn reloading_terminates_the_command() {
        let worker = build_worker(&PoolConfiguration {
            ttl_secs: Some(1),
            ..pool("/bin/sh", &["-c", "exec sleep 30"])
        });

        let (worker, exit_code) = run(worker).await;
        assert_eq!(exit_code, RELOAD_EXIT_CODE);
        assert_eq!(worker.state(), LifecycleState::Terminated);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn commands_do_not_outlive_the_spawning_thread() {
        use std::os::unix::process::ExitStatusExt as _;

        let spec = CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "trap '' TERM; while true; do sleep 0.1; done".to_string()],
            env: BTreeMap::new(),
        };

        let mut child = std::thread::spawn(move || spec.command().spawn().unwrap())
            .join()
            .unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn command_environment_excludes_worker_identity() {
        let mut config = pool("/bin/sh", &["-c", r#"test -z "$HEARTH_IPC_FD" && test "$GREETING" = hello"#]);
        config.env.insert("GREETING".to_string(), "hello".to_string());

        let (_, exit_code) = run(build_worker(&config)).await;
        assert_eq!(exit_code, 0);
    }
}
