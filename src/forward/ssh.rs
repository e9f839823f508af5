//! SSH forward controller using russh.
//!
//! A local (`ssh`) forward accepts on the bind port and opens one
//! `direct-tcpip` channel per connection. A reverse (`ssh-remote`) forward
//! asks the server to listen and serves the forwarded channels by dialing
//! the workstation port. Authentication tries the usual key files, then
//! falls back to the ssh-agent.

use russh::Channel;
use russh::client::{self, Config, Handle, Handler, Msg, Session};
use russh::keys::{Algorithm, PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Forward, ForwardKind};
use crate::view::{SharedView, View as _};

use super::{ForwardError, ForwardState, PortMap, Result, StateCell};

/// How often the session is probed for liveness once the tunnel is up.
const SESSION_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Parsed `[user@]host[:port]` SSH target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Remote {
    pub user: String,
    pub host: String,
    pub port: u16,
}

pub(crate) fn parse_remote(remote: &str) -> Result<Remote> {
    let invalid = || ForwardError::InvalidRemote(remote.to_string());

    if remote.trim().is_empty() {
        return Err(invalid());
    }

    let (user, rest) = match remote.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        Some(_) => return Err(invalid()),
        None => (
            std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            remote,
        ),
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, 22),
    };
    if host.is_empty() {
        return Err(invalid());
    }

    Ok(Remote {
        user,
        host: host.to_string(),
        port,
    })
}

/// Client-side handler. Reverse forwards land here: the server opens a
/// `forwarded-tcpip` channel and we bridge it onto the mapped workstation
/// port.
pub(crate) struct TunnelHandler {
    /// remote listener port -> workstation port to dial
    reverse_dials: HashMap<u32, u16>,
}

impl Handler for TunnelHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        // Host key verification is delegated to the operator's known_hosts
        // hygiene, as with `ssh -o StrictHostKeyChecking=no`.
        async { Ok(true) }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        let dial_port = self.reverse_dials.get(&connected_port).copied();
        debug!(
            connected = %format!("{connected_address}:{connected_port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "Reverse channel opened"
        );

        async move {
            let Some(port) = dial_port else {
                warn!(connected_port, "No reverse mapping for forwarded channel");
                return Ok(());
            };

            tokio::spawn(async move {
                match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                    Ok(mut socket) => {
                        let mut stream = channel.into_stream();
                        let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
                    }
                    Err(e) => warn!(port, error = %e, "Reverse forward dial failed"),
                }
            });
            Ok(())
        }
    }
}

/// Connect and authenticate one SSH session.
pub(crate) async fn connect(
    remote: &Remote,
    reverse_dials: HashMap<u32, u16>,
    keys_dir: Option<PathBuf>,
) -> Result<Handle<TunnelHandler>> {
    let config = Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        keepalive_max: 3,
        ..Default::default()
    };
    let handler = TunnelHandler { reverse_dials };

    debug!(host = %remote.host, port = remote.port, "Connecting to SSH server");
    let mut handle = client::connect(
        Arc::new(config),
        (remote.host.as_str(), remote.port),
        handler,
    )
    .await
    .map_err(|e| ForwardError::Ssh(e.to_string()))?;

    authenticate(&mut handle, &remote.user, keys_dir).await?;
    info!(host = %remote.host, user = %remote.user, "SSH connection established");

    Ok(handle)
}

/// Try the usual key files in order, then the ssh-agent.
async fn authenticate(
    handle: &mut Handle<TunnelHandler>,
    user: &str,
    keys_dir: Option<PathBuf>,
) -> Result<()> {
    let keys_dir = keys_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
    });

    let mut last_error = None;
    for key_name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
        let key_path = keys_dir.join(key_name);
        if !key_path.exists() {
            continue;
        }

        match try_key_auth(handle, user, &key_path).await {
            Ok(true) => {
                debug!(key = %key_path.display(), "Key accepted");
                return Ok(());
            }
            Ok(false) => debug!(key = %key_path.display(), "Key not accepted"),
            Err(e) => {
                debug!(key = %key_path.display(), error = %e, "Key auth failed");
                last_error = Some(e);
            }
        }
    }

    match try_agent_auth(handle, user).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) => last_error = Some(e),
    }

    Err(last_error.unwrap_or_else(|| {
        ForwardError::Ssh(format!(
            "no SSH key in {} was accepted and the agent had none either",
            keys_dir.display()
        ))
    }))
}

async fn try_key_auth(
    handle: &mut Handle<TunnelHandler>,
    user: &str,
    key_path: &Path,
) -> Result<bool> {
    let passphrase = std::env::var("MONDAY_SSH_KEY_PASSPHRASE").ok();
    let key = load_secret_key(key_path, passphrase.as_deref()).map_err(|e| {
        ForwardError::Ssh(format!("cannot load key {}: {e}", key_path.display()))
    })?;

    let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
        handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| ForwardError::Ssh(e.to_string()))?
            .flatten()
    } else {
        None
    };

    let auth_result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| ForwardError::Ssh(e.to_string()))?;

    Ok(auth_result.success())
}

async fn try_agent_auth(handle: &mut Handle<TunnelHandler>, user: &str) -> Result<bool> {
    #[cfg(unix)]
    {
        use russh::keys::agent::client::AgentClient;

        let mut agent = match AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(_) => return Ok(false),
        };

        let keys = agent
            .request_identities()
            .await
            .map_err(|e| ForwardError::Ssh(format!("ssh-agent identities failed: {e}")))?;

        for key in keys {
            match handle
                .authenticate_publickey_with(user, key.clone(), None, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    return Err(ForwardError::Ssh(format!(
                        "ssh-agent authentication failed: {e}"
                    )));
                }
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    {
        let _ = (handle, user);
        Ok(false)
    }
}

/// Establish the forward's tunnels and hold them until the session dies.
pub(crate) async fn run_tunnel(
    view: &SharedView,
    forward: &Forward,
    maps: &[PortMap],
    state: &Arc<StateCell>,
) -> Result<()> {
    state.set(ForwardState::Resolving);
    let remote = parse_remote(&forward.values.remote)?;

    state.set(ForwardState::Dialing);
    if forward.kind == ForwardKind::SshRemote {
        run_remote_forwards(view, &forward.name, maps, state, &remote).await
    } else {
        run_local_forwards(view, &forward.name, maps, state, &remote, None).await
    }
}

/// Serve local forwards: accept on each bind port, bridge every connection
/// through a `direct-tcpip` channel.
pub(crate) async fn run_local_forwards(
    view: &SharedView,
    name: &str,
    maps: &[PortMap],
    state: &Arc<StateCell>,
    remote: &Remote,
    keys_dir: Option<PathBuf>,
) -> Result<()> {
    let handle = Arc::new(connect(remote, HashMap::new(), keys_dir).await?);

    let mut listeners = Vec::new();
    for map in maps {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, map.bind_port)).await?;
        listeners.push((listener, *map));
    }

    let (err_tx, mut err_rx) = mpsc::channel::<ForwardError>(1);
    let mut guard = TaskGuard::default();

    for (listener, map) in listeners {
        let handle = Arc::clone(&handle);
        let err_tx = err_tx.clone();
        let name = name.to_string();
        guard.spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = err_tx.try_send(ForwardError::Io(e));
                        return;
                    }
                };

                match handle
                    .channel_open_direct_tcpip(
                        "127.0.0.1",
                        u32::from(map.remote_port),
                        &peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => {
                        tokio::spawn(async move {
                            let mut socket = socket;
                            let mut stream = channel.into_stream();
                            let _ =
                                tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(forward = %name, error = %e, "direct-tcpip open failed");
                        let _ = err_tx.try_send(ForwardError::Ssh(e.to_string()));
                        return;
                    }
                }
            }
        });
    }

    state.set(ForwardState::Ready);
    for map in maps {
        view.writef(format_args!(
            "Forward '{name}' tunnelling 127.0.0.1:{} to {}:{}",
            map.bind_port, remote.host, map.remote_port
        ));
    }

    loop {
        tokio::select! {
            err = err_rx.recv() => {
                return Err(err.unwrap_or_else(|| ForwardError::Ssh("channel error".to_string())));
            }
            _ = tokio::time::sleep(SESSION_PROBE_INTERVAL) => {
                if handle.is_closed() {
                    return Err(ForwardError::Ssh("connection lost".to_string()));
                }
            }
        }
    }
}

/// Serve reverse forwards: the remote host listens on each bind port and the
/// handler bridges forwarded channels back onto workstation ports.
async fn run_remote_forwards(
    view: &SharedView,
    name: &str,
    maps: &[PortMap],
    state: &Arc<StateCell>,
    remote: &Remote,
) -> Result<()> {
    let reverse_dials: HashMap<u32, u16> = maps
        .iter()
        .map(|map| (u32::from(map.bind_port), map.remote_port))
        .collect();

    let mut handle = connect(remote, reverse_dials, None).await?;

    for map in maps {
        handle
            .tcpip_forward("127.0.0.1", u32::from(map.bind_port))
            .await
            .map_err(|e| ForwardError::Ssh(e.to_string()))?;
    }

    state.set(ForwardState::Ready);
    for map in maps {
        view.writef(format_args!(
            "Forward '{name}': {}:{} now reaches 127.0.0.1:{}",
            remote.host, map.bind_port, map.remote_port
        ));
    }

    loop {
        tokio::time::sleep(SESSION_PROBE_INTERVAL).await;
        if handle.is_closed() {
            return Err(ForwardError::Ssh("connection lost".to_string()));
        }
    }
}

/// Aborts its tasks when dropped, so a cancelled tunnel attempt cannot leak
/// accept loops holding the session alive.
#[derive(Default)]
struct TaskGuard(Vec<tokio::task::JoinHandle<()>>);

impl TaskGuard {
    fn spawn(&mut self, future: impl Future<Output = ()> + Send + 'static) {
        self.0.push(tokio::spawn(future));
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}
