//! Filesystem watcher and restart sequencing.
//!
//! Each watched application gets its own debouncer (300 ms window) and its
//! own worker task, so a restart of one application never blocks another.
//! The worker's event channel has capacity one: bursts arriving during a
//! restart coalesce into a single follow-up. Crash notifications from the
//! runner arrive on the same path as file events.

use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::build::{Builder, Setuper};
use crate::config::{Application, Project};
use crate::forward::Forwarder;
use crate::run::{Runner, RunnerEvent};
use crate::view::{SharedView, View as _};

/// Events within this window coalesce into one restart.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Cannot watch '{path}' for application '{app}': {source}")]
    Watch {
        app: String,
        path: String,
        source: notify::Error,
    },
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Keeps one application's debouncer and bridge thread alive.
struct WatchHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    _thread: std::thread::JoinHandle<()>,
}

/// Coordinates Setuper, Builder, Runner and Forwarder on file changes.
pub struct Watcher {
    view: SharedView,
    project: Project,
    setuper: Arc<Setuper>,
    builder: Arc<Builder>,
    runner: Arc<Runner>,
    forwarder: Arc<Forwarder>,
    handles: Mutex<Vec<WatchHandle>>,
    triggers: Mutex<HashMap<String, mpsc::Sender<()>>>,
    stopped: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Watcher {
    pub fn new(
        view: SharedView,
        project: Project,
        setuper: Arc<Setuper>,
        builder: Arc<Builder>,
        runner: Arc<Runner>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            view,
            project,
            setuper,
            builder,
            runner,
            forwarder,
            handles: Mutex::new(Vec::new()),
            triggers: Mutex::new(HashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Arm watching for every `watch = true` application and start routing
    /// runner crash events into the same restart path.
    pub fn arm(
        self: &Arc<Self>,
        mut runner_events: mpsc::UnboundedReceiver<RunnerEvent>,
    ) -> Result<()> {
        for app in &self.project.applications {
            if !app.watch {
                continue;
            }
            self.watch_application(app)?;
        }

        // Crash events re-enter the per-application trigger channels so the
        // same coalescing applies.
        let watcher = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = runner_events.recv() => {
                        let Some(RunnerEvent::Crashed { app }) = event else { break };
                        watcher.trigger(&app);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    fn watch_application(self: &Arc<Self>, app: &Application) -> Result<()> {
        let path = app.effective_path();

        let (raw_tx, raw_rx) = std_mpsc::channel();
        let mut debouncer =
            new_debouncer(DEBOUNCE_WINDOW, raw_tx).map_err(|source| WatchError::Watch {
                app: app.name.clone(),
                path: path.display().to_string(),
                source,
            })?;
        debouncer
            .watcher()
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                app: app.name.clone(),
                path: path.display().to_string(),
                source,
            })?;

        info!(app = %app.name, path = %path.display(), "Watching for changes");

        // Capacity one: a burst during a restart queues exactly one more.
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        self.triggers
            .lock()
            .insert(app.name.clone(), trigger_tx.clone());

        let bridge_name = app.name.clone();
        let bridge = std::thread::spawn(move || {
            for result in raw_rx {
                match result {
                    Ok(events) if !events.is_empty() => {
                        let _ = trigger_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(app = %bridge_name, error = %e, "Watch error"),
                }
            }
        });

        self.handles.lock().push(WatchHandle {
            _debouncer: debouncer,
            _thread: bridge,
        });

        let watcher = Arc::clone(self);
        let app = app.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = trigger_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        watcher.restart_application(&app).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// Queue a restart for an application, coalescing with any pending one.
    pub fn trigger(&self, name: &str) {
        if let Some(tx) = self.triggers.lock().get(name) {
            let _ = tx.try_send(());
        }
    }

    /// Setup, build, restart; a failing step suppresses everything after it.
    /// A watched forward with the same name restarts after the application.
    async fn restart_application(&self, app: &Application) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        self.view
            .writef(format_args!("Change detected for '{}'", app.name));

        if let Err(e) = self.setuper.run_app(app).await {
            self.view
                .writef(format_args!("Setup failed, not restarting: {e}"));
            warn!(app = %app.name, error = %e, "Setup failed");
            return;
        }

        if let Err(e) = self.builder.build_app(app).await {
            self.view
                .writef(format_args!("Build failed, not restarting: {e}"));
            warn!(app = %app.name, error = %e, "Build failed");
            return;
        }

        if let Err(e) = self.runner.restart(&app.name).await {
            self.view
                .writef(format_args!("Restart of '{}' failed: {e}", app.name));
            return;
        }

        if self.forwarder.is_watched(&app.name) {
            self.forwarder.restart(&app.name);
        }
    }

    /// Stop watching. Pending restarts are abandoned.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.handles.lock().clear();
        self.triggers.lock().clear();
    }
}
