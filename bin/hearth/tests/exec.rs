use std::process::Command;

fn run_with_config(config: &str) -> (i32, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hearth.yaml");
    std::fs::write(&path, config).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_hearth"))
        .arg("run")
        .arg("-c")
        .arg(&path)
        .env_remove("HEARTH_LOG_LEVEL")
        .env_remove("HEARTH_LOG_FORMAT_JSON")
        .env_remove("HEARTH_WORKER_NAME")
        .env_remove("HEARTH_WORKER_INDEX")
        .env_remove("HEARTH_IPC_FD")
        .output()
        .unwrap();

    (output.status.code().unwrap_or(-1), String::from_utf8_lossy(&output.stderr).into_owned())
}

#[test]
fn failed_exec_is_reported() {
    let (exit_code, stderr) = run_with_config(
        r#"
shutdown_timeout_secs: 2
workers:
  - name: detached
    command: /nonexistent/hearth-program
    exec: true
"#,
    );

    assert_eq!(exit_code, 0, "{}", stderr);
    assert!(stderr.contains("Executing external program."), "{}", stderr);
    assert!(stderr.contains("Failed to execute external program"), "{}", stderr);
    assert!(stderr.contains("/nonexistent/hearth-program"), "{}", stderr);
}

#[test]
fn supervised_commands_exit_with_their_worker() {
    let (exit_code, stderr) = run_with_config(
        r#"
workers:
  - name: oneshot
    command: /bin/sh
    args: ["-c", "exit 0"]
"#,
    );

    assert_eq!(exit_code, 0, "{}", stderr);
    assert!(stderr.contains("Worker process stopped."), "{}", stderr);
}
