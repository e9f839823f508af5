//! Lifecycle root for `monday run`.
//!
//! Startup order: hostfile → proxy registration (through the forwarder) →
//! proxy listeners → tunnels → setup → initial build → applications →
//! watcher. Shutdown strictly reverses the dependency order: watcher →
//! runner → forwarder → proxy → hostfile.

use std::sync::Arc;
use tracing::info;

use crate::build::{Builder, Setuper};
use crate::config;
use crate::forward::Forwarder;
use crate::hostfile::Hostfile;
use crate::proxy::Proxy;
use crate::run::Runner;
use crate::view::{BufferedView, SharedView, StderrView, View};
use crate::watch::Watcher;

/// Exit code reported after an interrupt-triggered shutdown.
const EXIT_INTERRUPTED: i32 = 130;

/// Capacity of the UI line buffer.
const UI_BUFFER_LINES: usize = 2000;

pub async fn run(
    project_name: Option<&str>,
    ui_flag: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let config = config::load()?;
    let project = config.select_project(project_name)?.clone();

    let ui_enabled =
        ui_flag || std::env::var("MONDAY_ENABLE_UI").is_ok_and(|v| !v.is_empty());
    let view: SharedView = if ui_enabled {
        Arc::new(BufferedView::new(UI_BUFFER_LINES))
    } else {
        Arc::new(StderrView)
    };

    view.writef(format_args!(
        "Running project '{}' ({} applications, {} forwards)",
        project.name,
        project.applications.len(),
        project.forwards.len()
    ));

    let hostfile = Arc::new(Hostfile::open()?);
    let proxy = Arc::new(Proxy::new(Arc::clone(&view), Arc::clone(&hostfile)));

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&view),
        Arc::clone(&proxy),
        project.clone(),
    ));
    forwarder.register()?;

    // Hostname rewrites are on disk at this point; listeners may accept.
    proxy.listen().await?;
    forwarder.start();

    let setuper = Arc::new(Setuper::new(Arc::clone(&view), project.clone()));
    let builder = Arc::new(Builder::new(Arc::clone(&view), project.clone()));

    if let Err(e) = setuper.run_all().await {
        view.writef(format_args!("Setup failed: {e}"));
        shutdown(&view, None, None, &forwarder, &proxy, &hostfile).await;
        return Err(Box::new(e));
    }
    if let Err(e) = builder.build_all().await {
        view.writef(format_args!("Build failed: {e}"));
        shutdown(&view, None, None, &forwarder, &proxy, &hostfile).await;
        return Err(Box::new(e));
    }

    let (runner, runner_events) = Runner::new(
        Arc::clone(&view),
        Arc::clone(&proxy),
        Arc::clone(&hostfile),
        project.clone(),
    );
    runner.run_all();

    let watcher = Arc::new(Watcher::new(
        Arc::clone(&view),
        project.clone(),
        setuper,
        builder,
        Arc::clone(&runner),
        Arc::clone(&forwarder),
    ));
    watcher.arm(runner_events)?;

    view.writef(format_args!(
        "Project '{}' is up; press Ctrl-C to stop",
        project.name
    ));

    wait_for_interrupt().await?;

    shutdown(
        &view,
        Some(&watcher),
        Some(&runner),
        &forwarder,
        &proxy,
        &hostfile,
    )
    .await;

    Ok(EXIT_INTERRUPTED)
}

async fn wait_for_interrupt() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Ordered teardown. Components not yet constructed are passed as `None`.
async fn shutdown(
    view: &SharedView,
    watcher: Option<&Arc<Watcher>>,
    runner: Option<&Arc<Runner>>,
    forwarder: &Arc<Forwarder>,
    proxy: &Arc<Proxy>,
    hostfile: &Arc<Hostfile>,
) {
    view.writef(format_args!(
        "Bye, closing local applications and remote connections"
    ));

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    if let Some(runner) = runner {
        runner.stop().await;
    }
    forwarder.stop().await;
    if let Err(e) = proxy.stop().await {
        view.writef(format_args!("Proxy teardown left residue: {e}"));
    }
    if let Err(e) = hostfile.end() {
        view.writef(format_args!("Hostfile cleanup failed: {e}"));
    }

    info!("Shutdown complete");
}
