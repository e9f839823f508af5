//! Process supervision for local applications.
//!
//! Every application runs in its own process group so a stop signal reaches
//! the whole tree; stdout and stderr stream line-by-line into the view with
//! a `[name]` prefix. Termination is SIGINT to the group, a grace wait, then
//! SIGKILL.

mod env;

pub use env::{compose, parse_env_file};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Application, EXECUTABLE_GO, Project};
use crate::hostfile::Hostfile;
use crate::proxy::Proxy;
use crate::view::{SharedView, View as _};

/// Delay before a crashed watched application is queued for restart.
const CRASH_RESTART_DELAY: Duration = Duration::from_millis(500);
/// Extra wait after SIGKILL for the process group to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Application '{0}' is not part of the project")]
    UnknownApplication(String),

    #[error("Failed to read env file {0}: {1}")]
    EnvFile(PathBuf, io::Error),

    #[error("Failed to start application '{name}': {source}")]
    Spawn { name: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Lifecycle notifications emitted by monitor tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// A watched application exited unexpectedly and wants a restart.
    Crashed { app: String },
}

struct LiveProcess {
    pid: i32,
    stop_grace: Duration,
    stopping: Arc<AtomicBool>,
    exited_rx: watch::Receiver<bool>,
}

/// Supervisor for the project's local applications.
pub struct Runner {
    view: SharedView,
    proxy: Arc<Proxy>,
    hostfile: Arc<Hostfile>,
    project: Project,
    processes: Mutex<HashMap<String, LiveProcess>>,
    /// Spawn failures already surfaced this config load
    reported_spawn_failures: Mutex<HashSet<String>>,
    events_tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl Runner {
    pub fn new(
        view: SharedView,
        proxy: Arc<Proxy>,
        hostfile: Arc<Hostfile>,
        project: Project,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Self {
            view,
            proxy,
            hostfile,
            project,
            processes: Mutex::new(HashMap::new()),
            reported_spawn_failures: Mutex::new(HashSet::new()),
            events_tx,
        });
        (runner, events_rx)
    }

    /// Launch every application in the project. Failures are surfaced and do
    /// not prevent the remaining applications from starting.
    pub fn run_all(self: &Arc<Self>) {
        for app in self.project.applications.clone() {
            if let Err(e) = self.run(&app) {
                self.view
                    .writef(format_args!("Cannot run '{}': {e}", app.name));
            }
        }
    }

    /// Launch one application in its own process group and start streaming
    /// its output.
    pub fn run(self: &Arc<Self>, app: &Application) -> Result<()> {
        let cwd = app.effective_path();
        let env = compose(app, &self.proxy.forwards())?;

        // Other local applications reach this one by its declared hostname.
        if let Some(hostname) = app.hostname.as_deref()
            && !hostname.is_empty()
            && let Err(e) = self.hostfile.add_host("127.0.0.1", hostname)
        {
            self.view.writef(format_args!(
                "Cannot map hostname '{hostname}' for '{}': {e}",
                app.name
            ));
            warn!(app = %app.name, hostname, error = %e, "Hostname mapping failed");
        }

        let mut command = match app.executable.as_str() {
            EXECUTABLE_GO => {
                let mut command = Command::new(EXECUTABLE_GO);
                command.arg("run").arg(".").args(&app.args);
                command
            }
            executable => {
                let mut command = Command::new(executable);
                command.args(&app.args);
                command
            }
        };

        command
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        self.view.writef(format_args!(
            "Running '{}' ({} {})",
            app.name,
            app.executable,
            app.args.join(" ")
        ));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.report_spawn_failure(&app.name, &app.executable, &e);
                return Err(RunnerError::Spawn {
                    name: app.name.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().map(|pid| pid as i32).unwrap_or_default();
        info!(app = %app.name, pid, cwd = %cwd.display(), "Application started");

        if let Some(stdout) = child.stdout.take() {
            self.stream_output(&app.name, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.stream_output(&app.name, stderr);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);

        // Monitor task: owns the child, reaps it, and reports unexpected
        // exits of watched applications for a coalesced restart.
        {
            let runner = Arc::clone(self);
            let stopping = Arc::clone(&stopping);
            let app = app.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                let _ = exited_tx.send(true);

                if stopping.load(Ordering::SeqCst) {
                    return;
                }

                let code = status.as_ref().ok().and_then(|s| s.code());
                runner.view.writef(format_args!(
                    "Application '{}' exited ({})",
                    app.name,
                    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
                ));
                warn!(app = %app.name, ?code, "Application exited unexpectedly");

                if app.watch && code != Some(0) {
                    tokio::time::sleep(CRASH_RESTART_DELAY).await;
                    let _ = runner.events_tx.send(RunnerEvent::Crashed {
                        app: app.name.clone(),
                    });
                }
            });
        }

        self.processes.lock().insert(
            app.name.clone(),
            LiveProcess {
                pid,
                stop_grace: app.stop_grace(),
                stopping,
                exited_rx,
            },
        );

        Ok(())
    }

    /// Stop-then-run, used by the watcher.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<()> {
        let app = self
            .project
            .application(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownApplication(name.to_string()))?;

        self.stop_app(name).await;
        self.run(&app)
    }

    /// Terminate one application's process group: SIGINT, grace wait, then
    /// SIGKILL. Returns once the group has exited.
    pub async fn stop_app(&self, name: &str) {
        let Some(process) = self.processes.lock().remove(name) else {
            return;
        };

        process.stopping.store(true, Ordering::SeqCst);
        debug!(app = name, pid = process.pid, "Stopping application");

        signal_group(process.pid, Signal::SIGINT);

        let mut exited_rx = process.exited_rx;
        let exited = tokio::time::timeout(process.stop_grace, exited_rx.wait_for(|v| *v))
            .await
            .is_ok();

        if !exited {
            warn!(app = name, pid = process.pid, "Grace expired; killing process group");
            self.view.writef(format_args!(
                "Application '{name}' did not stop in time, killing it"
            ));
            signal_group(process.pid, Signal::SIGKILL);
            let _ = tokio::time::timeout(KILL_WAIT, exited_rx.wait_for(|v| *v)).await;
        }

        // The leader is gone; sweep any group members that ignored the
        // interrupt (background jobs of non-interactive shells do).
        signal_group(process.pid, Signal::SIGKILL);

        info!(app = name, "Application stopped");
    }

    /// Stop every application concurrently; returns when all process groups
    /// have exited or been force-killed.
    pub async fn stop(self: &Arc<Self>) {
        let names: Vec<String> = self.processes.lock().keys().cloned().collect();

        let mut handles = Vec::new();
        for name in names {
            let runner = Arc::clone(self);
            handles.push(tokio::spawn(
                async move { runner.stop_app(&name).await },
            ));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Whether an application currently has a live process.
    pub fn is_running(&self, name: &str) -> bool {
        self.processes.lock().contains_key(name)
    }

    /// PID of an application's live process, if any.
    pub fn pid(&self, name: &str) -> Option<i32> {
        self.processes.lock().get(name).map(|p| p.pid)
    }

    fn stream_output(
        self: &Arc<Self>,
        name: &str,
        output: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let view = Arc::clone(&self.view);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                view.writef(format_args!("[{name}] {line}"));
            }
        });
    }

    fn report_spawn_failure(&self, name: &str, executable: &str, error: &io::Error) {
        let mut reported = self.reported_spawn_failures.lock();
        if !reported.insert(name.to_string()) {
            return;
        }

        if error.kind() == io::ErrorKind::NotFound {
            self.view.writef(format_args!(
                "Executable '{executable}' was not found for application '{name}'"
            ));
        } else {
            self.view.writef(format_args!(
                "Cannot start application '{name}': {error}"
            ));
        }
    }
}

fn signal_group(pid: i32, signal: Signal) {
    if pid <= 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        debug!(pid, %signal, error = %e, "Signal delivery failed");
    }
}
