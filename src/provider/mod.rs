//! LAN link provider.
//!
//! Discovery and rendezvous engine: announces the local identity over
//! UDP, listens for peer announcements, accepts and dials TCP
//! connections, upgrades them to mutually authenticated TLS and hands
//! ready links to the registry. One muxer task owns the outstanding
//! connection table and the link map; per-connection handshakes run in
//! their own tasks, own their socket exclusively and report exactly one
//! terminal event back, so all bookkeeping mutation is serialized on
//! the muxer.

pub(crate) mod pending;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broadcast::{self, Broadcaster};
use crate::config::IdentityStore;
use crate::error::{LanLinkError, Result};
use crate::netwatch::NetworkMonitor;
use crate::protocol::constants::{
    DEFAULT_UDP_PORT, MAX_IDENTITY_LINE, MAX_REMEMBERED_IDENTITY_PACKETS, MAX_TCP_PORT,
    MIN_TCP_PORT,
};
use crate::protocol::IdentityPacket;
use crate::registry::{ClosedLink, Link, Registry};
use pending::{ConnCtx, LinkStream, Phase, ReadyConnection};

/// A published, encrypted link. Owned by the device-link layer.
pub type LanLink = Link<LinkStream>;

/// Startup parameters, consumed from configuration.
#[derive(Debug, Clone)]
pub struct LanLinkProviderConfig {
    /// Bind to loopback and accept loopback datagrams. For tests and
    /// local development only.
    pub test_mode: bool,
    /// Destination port for identity broadcasts and reinvitations.
    pub udp_broadcast_port: u16,
    /// Local port the UDP listener binds.
    pub udp_listen_port: u16,
}

impl Default for LanLinkProviderConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            udp_broadcast_port: DEFAULT_UDP_PORT,
            udp_listen_port: DEFAULT_UDP_PORT,
        }
    }
}

enum Event {
    Datagram {
        packet: IdentityPacket,
        sender: SocketAddr,
    },
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Finished {
        token: u64,
        ready: Option<Box<ReadyConnection>>,
    },
}

/// Peer discovery and secure-channel establishment.
///
/// Construction order is identity store → TCP acceptor (for the
/// advertised port) → broadcaster. Dropping the provider cancels all
/// internal tasks and closes the UDP socket and the acceptor;
/// connections still handshaking die with their sockets.
pub struct LanLinkProvider {
    tcp_port: u16,
    ready_rx: mpsc::UnboundedReceiver<LanLink>,
    monitor: NetworkMonitor,
    cancel: CancellationToken,
}

impl LanLinkProvider {
    /// Binds the UDP listener and the TCP acceptor, spawns the engine
    /// and announces the local identity once.
    pub async fn start(
        store: Arc<dyn IdentityStore>,
        config: LanLinkProviderConfig,
    ) -> Result<Self> {
        let bind_ip = if config.test_mode {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        let udp = bind_shared_udp(SocketAddr::from((bind_ip, config.udp_listen_port)))?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);

        let (listener, tcp_port) = bind_acceptor(bind_ip).await?;
        debug!("acceptor listening on TCP port {}", tcp_port);

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();

        let broadcaster = Arc::new(Broadcaster::new(
            udp.clone(),
            store.clone(),
            broadcast::platform_sources(),
            config.udp_broadcast_port,
            tcp_port,
            config.test_mode,
        ));
        let ctx = Arc::new(ConnCtx {
            store: store.clone(),
            broadcaster,
        });
        let registry = Registry::new(store.clone(), ready_tx, closed_tx);
        let monitor = NetworkMonitor::new(fire_tx, cancel.clone());

        tokio::spawn(run_udp_listener(
            udp,
            store.device_id(),
            config.test_mode,
            event_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_acceptor(listener, event_tx.clone(), cancel.clone()));
        tokio::spawn(run_muxer(
            ctx,
            registry,
            event_tx,
            event_rx,
            fire_rx,
            closed_rx,
            cancel.clone(),
        ));

        // Introduce ourselves to the network.
        monitor.notify();

        Ok(Self {
            tcp_port,
            ready_rx,
            monitor,
            cancel,
        })
    }

    /// The port the TCP acceptor is bound to, as advertised in identity
    /// broadcasts.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Reports a reachability event (interface up, network switch).
    /// Bursts are coalesced into a single broadcast round.
    pub fn network_changed(&self) {
        self.monitor.notify();
    }

    /// Waits for the next published link. `None` after the provider
    /// shut down.
    pub async fn next_link(&mut self) -> Option<LanLink> {
        self.ready_rx.recv().await
    }
}

impl Drop for LanLinkProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for LanLinkProvider {
    type Item = LanLink;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.ready_rx.poll_recv(cx)
    }
}

/// Binds the discovery socket with address sharing enabled so several
/// local instances can coexist.
fn bind_shared_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Binds the TCP acceptor to the first free port in the range.
async fn bind_acceptor(ip: Ipv4Addr) -> Result<(TcpListener, u16)> {
    for port in MIN_TCP_PORT..=MAX_TCP_PORT {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => debug!("cannot bind TCP port {}: {}", port, err),
        }
    }
    Err(LanLinkError::PortRangeExhausted(MIN_TCP_PORT, MAX_TCP_PORT))
}

/// Whether a received identity datagram warrants dialing the sender.
fn should_dial(packet: &IdentityPacket, local_device_id: &str) -> bool {
    if packet.device_id == local_device_id {
        // Our own announcement echoed back.
        return false;
    }
    if !packet.has_valid_tcp_port() {
        debug!(
            "device {} announced a TCP port outside the range",
            packet.device_id
        );
        return false;
    }
    true
}

async fn run_udp_listener(
    socket: Arc<UdpSocket>,
    local_device_id: String,
    test_mode: bool,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_IDENTITY_LINE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, sender)) => {
                        if sender.ip().is_loopback() && !test_mode {
                            continue;
                        }
                        let packet = match IdentityPacket::parse(&buf[..len]) {
                            Ok(packet) => packet,
                            Err(err) => {
                                debug!("dropping datagram from {}: {}", sender, err);
                                continue;
                            }
                        };
                        if !should_dial(&packet, &local_device_id) {
                            continue;
                        }
                        if event_tx.send(Event::Datagram { packet, sender }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // Windows reports ICMP port unreachable here.
                        if err.kind() == std::io::ErrorKind::ConnectionReset {
                            continue;
                        }
                        debug!("UDP receive error: {}", err);
                        break;
                    }
                }
            }
        }
    }
}

async fn run_acceptor(
    listener: TcpListener,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if event_tx.send(Event::Accepted { stream, peer }).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!("accept error: {}", err),
                }
            }
        }
    }
}

struct PendingEntry {
    peer: SocketAddr,
    device_id: Option<String>,
}

async fn run_muxer(
    ctx: Arc<ConnCtx>,
    mut registry: Registry<LinkStream>,
    event_tx: mpsc::UnboundedSender<Event>,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    mut fire_rx: mpsc::UnboundedReceiver<()>,
    mut closed_rx: mpsc::UnboundedReceiver<ClosedLink>,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<u64, PendingEntry> = HashMap::new();
    let mut next_token: u64 = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = fire_rx.recv() => {
                ctx.broadcaster.broadcast().await;
            }
            Some(closed) = closed_rx.recv() => {
                registry.remove_closed(closed);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::Datagram { packet, sender } => {
                        if pending.len() >= MAX_REMEMBERED_IDENTITY_PACKETS {
                            warn!(
                                "too many outstanding connections, ignoring {} received via UDP",
                                packet.device_id
                            );
                            continue;
                        }
                        let entry = PendingEntry {
                            peer: sender,
                            device_id: Some(packet.device_id.clone()),
                        };
                        let phase = Phase::Dialing {
                            remote: packet,
                            peer: sender,
                        };
                        spawn_connection(
                            &ctx,
                            &event_tx,
                            &mut pending,
                            &mut next_token,
                            entry,
                            phase,
                        );
                    }
                    Event::Accepted { stream, peer } => {
                        if pending.len() >= MAX_REMEMBERED_IDENTITY_PACKETS {
                            warn!(
                                "too many outstanding connections, ignoring {} received via TCP",
                                peer
                            );
                            continue;
                        }
                        let entry = PendingEntry {
                            peer,
                            device_id: None,
                        };
                        let phase = Phase::AwaitingIdentity { stream, peer };
                        spawn_connection(
                            &ctx,
                            &event_tx,
                            &mut pending,
                            &mut next_token,
                            entry,
                            phase,
                        );
                    }
                    Event::Finished { token, ready } => {
                        if let Some(entry) = pending.remove(&token) {
                            if let Some(ready) = ready {
                                let ready = *ready;
                                registry
                                    .publish(ready.stream, ready.identity, ready.peer_certificate)
                                    .await;
                            } else {
                                debug!(
                                    "connection with {} ({:?}) ended before a link was made",
                                    entry.peer, entry.device_id
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

fn spawn_connection(
    ctx: &Arc<ConnCtx>,
    event_tx: &mpsc::UnboundedSender<Event>,
    pending: &mut HashMap<u64, PendingEntry>,
    next_token: &mut u64,
    entry: PendingEntry,
    phase: Phase,
) {
    let token = *next_token;
    *next_token += 1;
    pending.insert(token, entry);

    let ctx = ctx.clone();
    let event_tx = event_tx.clone();
    tokio::spawn(async move {
        let ready = pending::run(&ctx, phase).await.map(Box::new);
        let _ = event_tx.send(Event::Finished { token, ready });
    });
}
