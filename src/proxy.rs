//! Endpoint proxy registry
//!
//! Per-agent map of TCP/UDP forwarders bound to assigned frontend
//! addresses. A forwarder's lifetime is bound by its supervisor: every
//! `create` is matched by a `remove` (or a prefix sweep) on supervisor
//! termination, including crash and cancel paths.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::Protocol;

/// One side of a forwarding pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    /// IP the forwarder binds or dials
    pub ip: String,
    /// Port the forwarder binds or dials
    pub port: u16,
}

impl ProxyAddress {
    /// Build an address
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    fn to_socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| Error::fatal(format!("invalid proxy address {}:{}", self.ip, self.port)))
    }
}

struct ProxyEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of active forwarders, keyed by `<service_id>:<endpoint>`
#[derive(Default)]
pub struct ProxyRegistry {
    entries: DashMap<String, ProxyEntry>,
}

impl ProxyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a forwarder from `frontend` to `backend`
    ///
    /// Idempotent per id: an existing forwarder with the same id is
    /// replaced. The listener is bound before this returns, so bind
    /// failures (e.g. a frontend IP not present on this host) surface
    /// here.
    pub async fn create(
        &self,
        proxy_id: &str,
        protocol: Protocol,
        frontend: ProxyAddress,
        backend: ProxyAddress,
    ) -> Result<()> {
        // replace semantics: wait for a previous forwarder to release its
        // listener before binding the frontend again
        if let Some((_, entry)) = self.entries.remove(proxy_id) {
            entry.cancel.cancel();
            entry.task.abort();
            let _ = entry.task.await;
        }
        let front = frontend.to_socket_addr()?;
        let back = backend.to_socket_addr()?;
        let cancel = CancellationToken::new();
        let task = match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(front)
                    .await
                    .map_err(|e| Error::io("proxy-bind", e))?;
                tokio::spawn(run_tcp(listener, back, cancel.clone()))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(front)
                    .await
                    .map_err(|e| Error::io("proxy-bind", e))?;
                tokio::spawn(run_udp(socket, back, cancel.clone()))
            }
        };
        info!(proxy = %proxy_id, %protocol, frontend = %front, backend = %back, "proxy registered");
        self.entries
            .insert(proxy_id.to_string(), ProxyEntry { cancel, task });
        Ok(())
    }

    /// Stop a forwarder and close its active connections
    pub fn remove(&self, proxy_id: &str) -> bool {
        match self.entries.remove(proxy_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                entry.task.abort();
                debug!(proxy = %proxy_id, "proxy removed");
                true
            }
            None => false,
        }
    }

    /// Remove every forwarder whose id starts with `prefix`
    ///
    /// Supervisors sweep `"<service_id>:"` on termination.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.remove(&id) {
                removed += 1;
            }
        }
        removed
    }

    /// Ids of active forwarders (sorted, for assertions)
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Accept loop: splice each connection to the backend
async fn run_tcp(listener: TcpListener, backend: SocketAddr, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "proxy accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, backend = %backend, "proxy connection");
                tokio::spawn(splice_tcp(stream, backend, cancel.clone()));
            }
        }
    }
}

async fn splice_tcp(mut stream: TcpStream, backend: SocketAddr, cancel: CancellationToken) {
    let mut upstream = match TcpStream::connect(backend).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(backend = %backend, error = %e, "proxy backend unreachable");
            return;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = copy_bidirectional(&mut stream, &mut upstream) => {
            if let Err(e) = result {
                debug!(backend = %backend, error = %e, "proxy connection ended");
            }
        }
    }
}

/// Datagram relay: one connected upstream socket per peer, replies routed
/// back by peer address
async fn run_udp(socket: UdpSocket, backend: SocketAddr, cancel: CancellationToken) {
    let socket = Arc::new(socket);
    let peers: Arc<DashMap<SocketAddr, Arc<UdpSocket>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp proxy recv failed");
                        continue;
                    }
                };
                let upstream = match peers.get(&peer) {
                    Some(existing) => existing.clone(),
                    None => {
                        let Ok(upstream) = new_upstream(backend).await else {
                            continue;
                        };
                        peers.insert(peer, upstream.clone());
                        tokio::spawn(relay_replies(
                            upstream.clone(),
                            socket.clone(),
                            peer,
                            cancel.clone(),
                        ));
                        upstream
                    }
                };
                if let Err(e) = upstream.send(&buf[..len]).await {
                    debug!(backend = %backend, error = %e, "udp forward failed");
                    peers.remove(&peer);
                }
            }
        }
    }
}

async fn new_upstream(backend: SocketAddr) -> Result<Arc<UdpSocket>> {
    let upstream = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| Error::io("udp-proxy", e))?;
    upstream
        .connect(backend)
        .await
        .map_err(|e| Error::io("udp-proxy", e))?;
    Ok(Arc::new(upstream))
}

async fn relay_replies(
    upstream: Arc<UdpSocket>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = upstream.recv(&mut buf) => match received {
                Ok(len) => {
                    if socket.send_to(&buf[..len], peer).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}
