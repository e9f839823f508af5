//! Forward controllers.
//!
//! Each declared forward runs as one task driving a small state machine:
//! `Idle → Resolving → Dialing → Ready ⇄ Reconnecting → Stopped`. Tunnel
//! failures re-enter the loop under exponential backoff with jitter; pod
//! identity is re-resolved on every attempt, so pod churn converges on the
//! replacement pod.

pub mod kubernetes;
pub mod ssh;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use crate::config::{ConfigError, Forward, ForwardKind, Project, parse_port_mapping};
use crate::proxy::{Proxy, ProxyError};
use crate::view::{SharedView, View as _};

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const BACKOFF_JITTER: f64 = 0.2;

/// How long `stop` waits for tunnel tasks before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("No running pod with all containers ready matches labels '{labels}' in namespace '{namespace}'")]
    NoReadyPod { namespace: String, labels: String },

    #[error("kubectl failed: {0}")]
    Kubectl(String),

    #[error("Tunnel for '{0}' exited: {1}")]
    TunnelExit(String, String),

    #[error("Invalid SSH remote '{0}': expected [user@]host[:port]")]
    InvalidRemote(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ForwardError>;

/// Forwarder lifecycle states. Transitions are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Resolving,
    Dialing,
    Ready,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ForwardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Dialing => "dialing",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Shared state cell for one forward; every transition is logged.
pub struct StateCell {
    name: String,
    view: SharedView,
    state: Mutex<ForwardState>,
}

impl StateCell {
    fn new(name: String, view: SharedView) -> Self {
        Self {
            name,
            view,
            state: Mutex::new(ForwardState::Idle),
        }
    }

    pub fn get(&self) -> ForwardState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, next: ForwardState) {
        let prev = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, next)
        };
        if prev == next {
            return;
        }

        info!(forward = %self.name, from = %prev, to = %next, "Forward transition");
        match next {
            ForwardState::Ready => self
                .view
                .writef(format_args!("Forward '{}' is ready", self.name)),
            ForwardState::Reconnecting => self
                .view
                .writef(format_args!("Forward '{}' reconnecting", self.name)),
            _ => {}
        }
    }
}

/// Exponential backoff: 500 ms doubling to a 30 s cap, ±20 % jitter.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    pub fn next(&mut self) -> Duration {
        let base = self.current;
        self.current = (base * BACKOFF_FACTOR).min(BACKOFF_CAP);
        base.mul_f64(1.0 + BACKOFF_JITTER * (fastrand::f64() * 2.0 - 1.0))
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// One loopback-to-remote port pairing served by a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    /// Port the tunnel binds (or, for remote forwards, the remote listener)
    pub bind_port: u16,
    /// Port on the other end of the tunnel
    pub remote_port: u16,
}

struct TunnelHandle {
    state: Arc<StateCell>,
    restart: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns every forward's tunnel task.
pub struct Forwarder {
    view: SharedView,
    proxy: Arc<Proxy>,
    project: Project,
    planned: Mutex<Vec<(Forward, Vec<PortMap>)>>,
    tunnels: Mutex<HashMap<String, TunnelHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Forwarder {
    pub fn new(view: SharedView, proxy: Arc<Proxy>, project: Project) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            view,
            proxy,
            project,
            planned: Mutex::new(Vec::new()),
            tunnels: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Allocate proxy addresses and plan port mappings for every forward.
    /// Proxified forwards register through the proxy (which writes the
    /// hostname rewrite); `kubernetes-remote` additionally keeps its declared
    /// local port as a direct listener, and `ssh-remote` bypasses the proxy
    /// entirely.
    pub fn register(&self) -> Result<()> {
        for forward in &self.project.forwards {
            let mut maps = Vec::new();

            for mapping in &forward.values.ports {
                let (local, remote) = parse_port_mapping(mapping)?;

                if forward.is_proxified() {
                    let pf = self.proxy.add_proxy_forward(
                        &forward.name,
                        &forward.values.hostname,
                        local,
                    )?;
                    maps.push(PortMap {
                        bind_port: pf.forward_port,
                        remote_port: remote,
                    });
                    if forward.kind == ForwardKind::KubernetesRemote {
                        maps.push(PortMap {
                            bind_port: local,
                            remote_port: remote,
                        });
                    }
                } else {
                    maps.push(PortMap {
                        bind_port: local,
                        remote_port: remote,
                    });
                }
            }

            self.planned.lock().push((forward.clone(), maps));
        }

        Ok(())
    }

    /// Spawn one tunnel task per registered forward.
    pub fn start(&self) {
        let planned: Vec<(Forward, Vec<PortMap>)> = self.planned.lock().clone();

        for (forward, maps) in planned {
            let state = Arc::new(StateCell::new(forward.name.clone(), Arc::clone(&self.view)));
            let restart = Arc::new(Notify::new());

            let task = tokio::spawn(drive(
                Arc::clone(&self.view),
                forward.clone(),
                maps,
                Arc::clone(&state),
                Arc::clone(&restart),
                self.shutdown_tx.subscribe(),
            ));

            self.tunnels.lock().insert(
                forward.name.clone(),
                TunnelHandle {
                    state,
                    restart,
                    task,
                },
            );
        }
    }

    /// Tear the named forward's tunnel down and re-establish it.
    pub fn restart(&self, name: &str) {
        if let Some(handle) = self.tunnels.lock().get(name) {
            info!(forward = name, "Forward restart requested");
            handle.restart.notify_one();
        }
    }

    /// Current state of a forward, if it is running.
    pub fn state(&self, name: &str) -> Option<ForwardState> {
        self.tunnels.lock().get(name).map(|h| h.state.get())
    }

    /// Whether a forward with this name exists and asked to be restarted on
    /// file changes.
    pub fn is_watched(&self, name: &str) -> bool {
        self.project
            .forward(name)
            .is_some_and(|forward| forward.watch)
    }

    /// Stop every tunnel. Idempotent; in-flight work is given a short grace
    /// window, then aborted.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<(String, TunnelHandle)> =
            self.tunnels.lock().drain().collect();

        for (name, handle) in handles {
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle.task).await.is_err() {
                warn!(forward = %name, "Tunnel did not stop in time; aborting");
                abort.abort();
            }
            handle.state.set(ForwardState::Stopped);
        }
    }
}

/// Per-forward driver loop: establish the tunnel, and on failure re-enter
/// under backoff. A restart request tears the current tunnel down without
/// backoff; shutdown exits the loop.
async fn drive(
    view: SharedView,
    forward: Forward,
    maps: Vec<PortMap>,
    state: Arc<StateCell>,
    restart: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    let mut last_pod: Option<String> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = run_tunnel(&view, &forward, &maps, &state, &mut last_pod);
        tokio::pin!(attempt);

        tokio::select! {
            result = &mut attempt => {
                let was_ready = state.get() == ForwardState::Ready;
                if let Err(e) = result {
                    view.writef(format_args!("Forward '{}' failed: {e}", forward.name));
                    warn!(forward = %forward.name, error = %e, "Tunnel attempt failed");
                }
                if was_ready {
                    backoff.reset();
                }
            }
            _ = restart.notified() => {
                state.set(ForwardState::Reconnecting);
                backoff.reset();
                continue;
            }
            _ = shutdown.changed() => break,
        }

        state.set(ForwardState::Reconnecting);
        let delay = backoff.next();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    state.set(ForwardState::Stopped);
}

async fn run_tunnel(
    view: &SharedView,
    forward: &Forward,
    maps: &[PortMap],
    state: &Arc<StateCell>,
    last_pod: &mut Option<String>,
) -> Result<()> {
    match forward.kind {
        ForwardKind::Kubernetes | ForwardKind::KubernetesRemote => {
            kubernetes::run_tunnel(view, forward, maps, state, last_pod).await
        }
        ForwardKind::Ssh | ForwardKind::SshRemote => {
            ssh::run_tunnel(view, forward, maps, state).await
        }
    }
}
