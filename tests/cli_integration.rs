//! CLI integration tests.
//!
//! Runs the compiled binary in a temp directory and checks the scaffolding
//! and error surfaces that don't need a privileged hosts file.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn run_monday(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_monday"))
        .args(args)
        .current_dir(cwd)
        // Keep the user-level config directory out of the discovery path.
        .env("XDG_CONFIG_HOME", cwd.join("xdg-config"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to run monday")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn version_flag_prints_the_crate_version() {
    let dir = TempDir::new().unwrap();
    let output = run_monday(&["--version"], dir.path());

    assert!(output.status.success());
    assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn init_scaffolds_a_config_file() {
    let dir = TempDir::new().unwrap();

    let output = run_monday(&["init"], dir.path());
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(dir.path().join("monday.toml").exists());

    let content = std::fs::read_to_string(dir.path().join("monday.toml")).unwrap();
    assert!(content.contains("[[projects]]"));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let dir = TempDir::new().unwrap();

    assert!(run_monday(&["init"], dir.path()).status.success());

    let second = run_monday(&["init"], dir.path());
    assert_eq!(second.status.code(), Some(1));
    assert!(stderr(&second).contains("already exists"));

    let forced = run_monday(&["init", "--force"], dir.path());
    assert!(forced.status.success());
}

#[test]
fn run_without_any_config_exits_with_an_error() {
    let dir = TempDir::new().unwrap();

    let output = run_monday(&["run"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("No monday.toml"));
}

#[test]
fn run_with_an_unknown_project_lists_the_configured_ones() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("monday.toml"),
        "[[projects]]\nname = \"alpha\"\n\n[[projects]]\nname = \"beta\"\n",
    )
    .unwrap();

    let output = run_monday(&["run", "ghost"], dir.path());
    assert_eq!(output.status.code(), Some(1));

    let err = stderr(&output);
    assert!(err.contains("ghost"), "{err}");
    assert!(err.contains("alpha"), "{err}");
    assert!(err.contains("beta"), "{err}");
}

#[test]
fn run_without_a_project_name_requires_a_single_project() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("monday.toml"),
        "[[projects]]\nname = \"alpha\"\n\n[[projects]]\nname = \"beta\"\n",
    )
    .unwrap();

    let output = run_monday(&["run"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("monday run <project>"));
}

/// The run lifecycle needs a writable hosts file; skip on locked-down hosts.
fn hosts_file_writable() -> bool {
    std::fs::OpenOptions::new()
        .append(true)
        .open("/etc/hosts")
        .is_ok()
}

#[test]
fn sigint_shuts_a_running_project_down_with_130() {
    if !hosts_file_writable() {
        return;
    }

    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("monday.toml"),
        r#"
        [[projects]]
        name = "solo"

        [[projects.local]]
        name = "sleeper"
        path = "."
        executable = "sh"
        args = ["-c", "sleep 30"]
        stop_grace_secs = 2
        "#,
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_monday"))
        .args(["run", "solo"])
        .current_dir(dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("xdg-config"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to run monday");

    // Give the lifecycle time to come up, then interrupt it.
    std::thread::sleep(std::time::Duration::from_millis(1500));
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child.id() as i32),
        nix::sys::signal::Signal::SIGINT,
    )
    .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "monday did not shut down after SIGINT"
        );
        std::thread::sleep(std::time::Duration::from_millis(100));
    };

    assert_eq!(status.code(), Some(130));
}

#[test]
fn unknown_subcommands_fail_with_usage() {
    let dir = TempDir::new().unwrap();

    let output = run_monday(&["frobnicate"], dir.path());
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unrecognized subcommand"));
}
