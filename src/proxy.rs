//! TCP proxy fabric.
//!
//! Each proxified forward gets its own loopback address and user-facing port.
//! The proxy accepts on `(proxy_ip, proxy_port)` and pipes bytes verbatim to
//! `127.0.0.1:forward_port`, where the forward's tunnel listens. Hostname
//! rewrites in the hosts file point production names at the allocated
//! loopback addresses, so local applications dial production hostnames and
//! land on the tunnel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::copy_bidirectional_with_sizes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::hostfile::{Hostfile, HostfileError};
use crate::view::{SharedView, View as _};

/// First loopback address handed out.
const BASE_IP: Ipv4Addr = Ipv4Addr::new(127, 1, 2, 1);
/// First user-facing proxy port handed out.
const BASE_PORT: u16 = 9400;
/// Per-direction copy buffer.
const COPY_BUFFER_SIZE: usize = 32 * 1024;
/// How long `stop` lets in-flight connections drain.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Loopback address space exhausted; cannot allocate an address for forward '{0}'")]
    IpExhausted(String),

    #[error("Proxy port range exhausted; cannot allocate a port for forward '{0}'")]
    PortExhausted(String),

    #[error("Failed to reserve a forward port: {0}")]
    ForwardPort(io::Error),

    #[error(transparent)]
    Hostfile(#[from] HostfileError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Runtime record coupling a declared forward to its allocated addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyForward {
    pub name: String,
    /// Production hostname rewritten onto `proxy_ip`
    pub hostname: String,
    pub proxy_ip: Ipv4Addr,
    /// User-visible port on `proxy_ip`
    pub proxy_port: u16,
    /// Port the forward's tunnel listens on (proxy dials it on 127.0.0.1)
    pub forward_port: u16,
    /// Declared local port, used by forwards that bypass the proxy
    pub local_port: u16,
}

impl ProxyForward {
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.proxy_ip), self.proxy_port)
    }

    pub fn forward_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.forward_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Aborted,
}

struct State {
    forwards: HashMap<String, Vec<ProxyForward>>,
    /// Registration order of names, for deterministic listings
    order: Vec<String>,
    ip_last_octet: u16,
    next_port: u32,
}

/// Allocator and byte pump for every proxified forward.
pub struct Proxy {
    view: SharedView,
    hostfile: Arc<Hostfile>,
    state: Mutex<State>,
    active_connections: Arc<AtomicUsize>,
    phase_tx: watch::Sender<Phase>,
}

impl Proxy {
    pub fn new(view: SharedView, hostfile: Arc<Hostfile>) -> Self {
        Self::with_base(view, hostfile, BASE_IP, BASE_PORT)
    }

    /// Start the cursors elsewhere. Tests use this to keep concurrent
    /// listeners from colliding on fixed ports.
    pub fn with_base(
        view: SharedView,
        hostfile: Arc<Hostfile>,
        base_ip: Ipv4Addr,
        base_port: u16,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Running);
        Self {
            view,
            hostfile,
            state: Mutex::new(State {
                forwards: HashMap::new(),
                order: Vec::new(),
                ip_last_octet: u16::from(base_ip.octets()[3]),
                next_port: u32::from(base_port),
            }),
            active_connections: Arc::new(AtomicUsize::new(0)),
            phase_tx,
        }
    }

    /// Register a forward: allocate its loopback address, user-facing port
    /// and tunnel port, and write the hostname rewrite. Forwards sharing a
    /// name share one loopback address; the port cursor still advances per
    /// registration so `(proxy_ip, proxy_port)` pairs stay unique.
    pub fn add_proxy_forward(
        &self,
        name: &str,
        hostname: &str,
        local_port: u16,
    ) -> Result<ProxyForward> {
        let forward_port = reserve_ephemeral_port()?;

        let pf = {
            let mut state = self.state.lock();

            let proxy_ip = match state.forwards.get(name).and_then(|list| list.first()) {
                Some(existing) => existing.proxy_ip,
                None => {
                    let octet = state.ip_last_octet;
                    if octet > 254 {
                        return Err(ProxyError::IpExhausted(name.to_string()));
                    }
                    state.ip_last_octet += 1;
                    Ipv4Addr::new(127, 1, 2, octet as u8)
                }
            };

            let proxy_port = state.next_port;
            if proxy_port > u32::from(u16::MAX) {
                return Err(ProxyError::PortExhausted(name.to_string()));
            }
            state.next_port += 1;

            let pf = ProxyForward {
                name: name.to_string(),
                hostname: hostname.to_string(),
                proxy_ip,
                proxy_port: proxy_port as u16,
                forward_port,
                local_port,
            };

            if !state.forwards.contains_key(name) {
                state.order.push(name.to_string());
            }
            state
                .forwards
                .entry(name.to_string())
                .or_default()
                .push(pf.clone());
            pf
        };

        // Hostname rewrite lands before `listen` ever accepts a byte. A
        // forward without a hostname still gets its addresses.
        if !hostname.is_empty() {
            self.hostfile.add_host(&pf.proxy_ip.to_string(), hostname)?;
        }

        self.view.writef(format_args!(
            "Forwarding {} ({}:{}) to 127.0.0.1:{}",
            pf.hostname, pf.proxy_ip, pf.proxy_port, pf.forward_port
        ));
        debug!(forward = name, hostname, proxy = %pf.proxy_addr(), "Registered proxy forward");

        Ok(pf)
    }

    /// Snapshot of every registered forward, in registration order.
    pub fn forwards(&self) -> Vec<ProxyForward> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|name| state.forwards.get(name))
            .flatten()
            .cloned()
            .collect()
    }

    /// Bind one listener per registered forward and start accepting. A bind
    /// failure degrades that forward only; the others keep going.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        for pf in self.forwards() {
            let addr = pf.proxy_addr();
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.view.writef(format_args!(
                        "Cannot listen on {addr} for forward '{}': {e}",
                        pf.name
                    ));
                    warn!(forward = %pf.name, %addr, error = %e, "Proxy listener bind failed; forward degraded");
                    continue;
                }
            };

            info!(forward = %pf.name, %addr, "Proxy listening");
            let proxy = Arc::clone(self);
            tokio::spawn(async move { proxy.accept_loop(listener, pf).await });
        }

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, pf: ProxyForward) {
        let mut phase_rx = self.phase_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(forward = %pf.name, error = %e, "Accept failed");
                            continue;
                        }
                    };
                    debug!(forward = %pf.name, %peer, "Accepted connection");

                    let proxy = Arc::clone(&self);
                    let pf = pf.clone();
                    tokio::spawn(async move { proxy.pipe(socket, pf).await });
                }
                _ = phase_rx.changed() => {
                    debug!(forward = %pf.name, "Proxy listener stopping");
                    return;
                }
            }
        }
    }

    /// Bidirectional byte copy between an accepted client and the tunnel
    /// side. A failed dial is logged and the client dropped; the tunnel may
    /// simply be re-establishing.
    async fn pipe(&self, mut client: TcpStream, pf: ProxyForward) {
        let downstream_addr = pf.forward_addr();
        let mut downstream = match TcpStream::connect(downstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.view.writef(format_args!(
                    "Forward '{}' is not reachable on {downstream_addr}: {e}",
                    pf.name
                ));
                warn!(forward = %pf.name, %downstream_addr, error = %e, "Downstream dial failed");
                return;
            }
        };

        self.active_connections.fetch_add(1, Ordering::SeqCst);
        let mut phase_rx = self.phase_tx.subscribe();

        tokio::select! {
            result = copy_bidirectional_with_sizes(
                &mut client,
                &mut downstream,
                COPY_BUFFER_SIZE,
                COPY_BUFFER_SIZE,
            ) => {
                match result {
                    Ok((up, down)) => {
                        debug!(forward = %pf.name, bytes_up = up, bytes_down = down, "Connection closed");
                    }
                    Err(e) => debug!(forward = %pf.name, error = %e, "Connection errored"),
                }
            }
            _ = phase_rx.wait_for(|phase| *phase == Phase::Aborted) => {
                debug!(forward = %pf.name, "Connection aborted by shutdown");
            }
        }

        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop accepting, drain in-flight connections within the grace window,
    /// then remove every hostname rewrite.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.phase_tx.send(Phase::Draining);

        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while self.active_connections.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = self.phase_tx.send(Phase::Aborted);

        // Hostfile entries come out only after the listeners are gone.
        for pf in self.forwards() {
            if !pf.hostname.is_empty() {
                self.hostfile.remove_host(&pf.hostname)?;
            }
        }

        info!("Proxy stopped");
        Ok(())
    }
}

/// Ask the OS for a free ephemeral port. The listener is released right
/// away; the tunnel binds the port when it comes up.
fn reserve_ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(ProxyError::ForwardPort)?;
    let port = listener
        .local_addr()
        .map_err(ProxyError::ForwardPort)?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::NullView;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_hostfile() -> (tempfile::TempDir, Arc<Hostfile>) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let hostfile = Arc::new(Hostfile::open_path(&path).unwrap());
        (dir, hostfile)
    }

    fn test_proxy(base_port: u16) -> (tempfile::TempDir, Arc<Proxy>) {
        let (dir, hostfile) = test_hostfile();
        let proxy = Arc::new(Proxy::with_base(
            Arc::new(NullView),
            hostfile,
            BASE_IP,
            base_port,
        ));
        (dir, proxy)
    }

    #[test]
    fn allocation_cursors_increment_per_forward() {
        let (_dir, proxy) = test_proxy(9400);

        let a = proxy.add_proxy_forward("auth", "auth.prod", 80).unwrap();
        let b = proxy.add_proxy_forward("billing", "billing.prod", 80).unwrap();
        let c = proxy.add_proxy_forward("search", "search.prod", 80).unwrap();

        assert_eq!(a.proxy_ip, Ipv4Addr::new(127, 1, 2, 1));
        assert_eq!(b.proxy_ip, Ipv4Addr::new(127, 1, 2, 2));
        assert_eq!(c.proxy_ip, Ipv4Addr::new(127, 1, 2, 3));
        assert_eq!(
            [a.proxy_port, b.proxy_port, c.proxy_port],
            [9400, 9401, 9402]
        );
    }

    #[test]
    fn same_name_shares_the_address_but_not_the_port() {
        let (_dir, proxy) = test_proxy(9410);

        let a = proxy.add_proxy_forward("auth", "auth.prod", 80).unwrap();
        let b = proxy.add_proxy_forward("auth", "auth-grpc.prod", 81).unwrap();

        assert_eq!(a.proxy_ip, b.proxy_ip);
        assert_ne!(a.proxy_port, b.proxy_port);
        assert_eq!(proxy.forwards().len(), 2);
    }

    #[test]
    fn allocations_stay_unique_at_scale() {
        let (_dir, proxy) = test_proxy(9420);

        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let pf = proxy
                .add_proxy_forward(&format!("fwd-{i}"), &format!("svc-{i}.prod"), 80)
                .unwrap();
            assert!(seen.insert((pf.proxy_ip, pf.proxy_port)));
        }
    }

    #[test]
    fn forward_ports_are_distinct_from_local_ports() {
        let (_dir, proxy) = test_proxy(9520);
        let pf = proxy.add_proxy_forward("auth", "auth.prod", 80).unwrap();
        assert_ne!(pf.forward_port, pf.local_port);
        assert_ne!(pf.forward_port, pf.proxy_port);
    }

    #[test]
    fn registration_writes_hostfile_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "").unwrap();
        let hostfile = Arc::new(Hostfile::open_path(&path).unwrap());
        let proxy = Proxy::with_base(Arc::new(NullView), Arc::clone(&hostfile), BASE_IP, 9430);

        proxy.add_proxy_forward("auth", "auth.prod", 80).unwrap();
        proxy.add_proxy_forward("billing", "billing.prod", 80).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("127.1.2.1 auth.prod"));
        assert!(content.contains("127.1.2.2 billing.prod"));
    }

    #[tokio::test]
    async fn bytes_round_trip_through_the_proxy() {
        let (_dir, proxy) = test_proxy(9440);
        let pf = proxy.add_proxy_forward("echo", "echo.prod", 80).unwrap();

        // Downstream echo server standing in for a tunnel.
        let downstream = TcpListener::bind(pf.forward_addr()).await.unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = downstream.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        proxy.listen().await.unwrap();

        let mut client = TcpStream::connect(pf.proxy_addr()).await.unwrap();
        client.write_all(b"ping through the fabric").await.unwrap();

        let mut reply = [0u8; 23];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping through the fabric");

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn downstream_dial_failure_keeps_the_listener_alive() {
        let (_dir, proxy) = test_proxy(9450);
        let pf = proxy.add_proxy_forward("flaky", "flaky.prod", 80).unwrap();

        proxy.listen().await.unwrap();

        // Nothing listens on the forward port yet: connection is accepted
        // then dropped.
        let mut first = TcpStream::connect(pf.proxy_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).await.unwrap(), 0);

        // The tunnel comes up; the next connection goes through.
        let downstream = TcpListener::bind(pf.forward_addr()).await.unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = downstream.accept().await.unwrap();
            socket.write_all(b"ok").await.unwrap();
        });

        let mut second = TcpStream::connect(pf.proxy_addr()).await.unwrap();
        let mut reply = [0u8; 2];
        second.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_removes_hostfile_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let hostfile = Arc::new(Hostfile::open_path(&path).unwrap());
        let proxy = Arc::new(Proxy::with_base(
            Arc::new(NullView),
            Arc::clone(&hostfile),
            BASE_IP,
            9460,
        ));

        proxy.add_proxy_forward("auth", "auth.prod", 80).unwrap();
        proxy.listen().await.unwrap();
        proxy.stop().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.0.0.1 localhost\n");
    }
}
