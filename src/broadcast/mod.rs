//! Identity broadcasting.
//!
//! The broadcaster announces the local identity over UDP so that peers
//! can initiate a rendezvous: one datagram per destination, where the
//! destinations are the broadcast address (loopback in test mode)
//! followed by every user-declared static peer address that parses.
//! It also emits the unicast reinvitations used by the reverse
//! connection fallback.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::IdentityStore;
use crate::protocol::constants::DISABLE_UDP_BROADCAST_ENV;
use crate::protocol::IdentityPacket;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const EMSGSIZE: i32 = 90;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) const EMSGSIZE: i32 = 40;
#[cfg(windows)]
pub(crate) const EMSGSIZE: i32 = 10040;
#[cfg(not(any(unix, windows)))]
pub(crate) const EMSGSIZE: i32 = 90;

pub(crate) fn is_datagram_too_large(err: &io::Error) -> bool {
    err.raw_os_error() == Some(EMSGSIZE)
}

/// Source endpoints to emit broadcasts from.
///
/// An empty list means one send through the shared (unbound) socket is
/// enough. On systems that do not route broadcast datagrams from the
/// default source across all interfaces (Windows, FreeBSD) the
/// per-interface implementation must be used instead, or peers on
/// non-default interfaces never hear the announcement.
pub(crate) trait BroadcastSources: Send + Sync {
    fn source_addrs(&self) -> Vec<Ipv4Addr>;
}

/// Single unbound send through the shared socket.
pub(crate) struct DefaultSource;

impl BroadcastSources for DefaultSource {
    fn source_addrs(&self) -> Vec<Ipv4Addr> {
        Vec::new()
    }
}

/// One transient sending socket per usable interface address.
pub(crate) struct PerInterfaceSources;

impl BroadcastSources for PerInterfaceSources {
    fn source_addrs(&self) -> Vec<Ipv4Addr> {
        datalink::interfaces()
            .iter()
            .filter(|iface| usable_interface(iface))
            .flat_map(|iface| ipv4_source_addrs(&iface.ips))
            .collect()
    }
}

fn usable_interface(iface: &NetworkInterface) -> bool {
    let usable = iface.is_up() && iface.is_broadcast();
    #[cfg(unix)]
    let usable = usable && iface.is_running();
    usable
}

fn ipv4_source_addrs(ips: &[IpNetwork]) -> Vec<Ipv4Addr> {
    ips.iter()
        .filter_map(|net| match net {
            IpNetwork::V4(net) if !net.ip().is_loopback() => Some(net.ip()),
            _ => None,
        })
        .collect()
}

pub(crate) fn platform_sources() -> Box<dyn BroadcastSources> {
    #[cfg(any(windows, target_os = "freebsd"))]
    {
        Box::new(PerInterfaceSources)
    }
    #[cfg(not(any(windows, target_os = "freebsd")))]
    {
        Box::new(DefaultSource)
    }
}

enum OutboundUdp<'a> {
    Shared(&'a UdpSocket),
    Bound(&'a StdUdpSocket),
}

impl OutboundUdp<'_> {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<()> {
        match self {
            OutboundUdp::Shared(socket) => socket.send_to(payload, target).await.map(|_| ()),
            OutboundUdp::Bound(socket) => socket.send_to(payload, target).map(|_| ()),
        }
    }
}

fn transient_source_socket(source: Ipv4Addr) -> io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::from((source, 0)).into())?;
    Ok(socket.into())
}

pub(crate) struct Broadcaster {
    socket: Arc<UdpSocket>,
    store: Arc<dyn IdentityStore>,
    sources: Box<dyn BroadcastSources>,
    broadcast_port: u16,
    tcp_port: u16,
    test_mode: bool,
}

impl Broadcaster {
    pub fn new(
        socket: Arc<UdpSocket>,
        store: Arc<dyn IdentityStore>,
        sources: Box<dyn BroadcastSources>,
        broadcast_port: u16,
        tcp_port: u16,
        test_mode: bool,
    ) -> Self {
        Self {
            socket,
            store,
            sources,
            broadcast_port,
            tcp_port,
            test_mode,
        }
    }

    /// Emits one identity datagram per destination, from every
    /// configured source endpoint.
    pub async fn broadcast(&self) {
        if std::env::var_os(DISABLE_UDP_BROADCAST_ENV).is_some() {
            warn!(
                "not broadcasting because {} is set",
                DISABLE_UDP_BROADCAST_ENV
            );
            return;
        }
        debug!("broadcasting identity packet");

        let destinations = self.destinations();
        let sources = self.sources.source_addrs();
        if sources.is_empty() {
            self.send_identity(OutboundUdp::Shared(&self.socket), &destinations)
                .await;
        } else {
            for source in sources {
                debug!("broadcasting as {}", source);
                match transient_source_socket(source) {
                    Ok(socket) => {
                        self.send_identity(OutboundUdp::Bound(&socket), &destinations)
                            .await;
                    }
                    Err(err) => warn!("cannot bind broadcast source {}: {}", source, err),
                }
            }
        }
    }

    /// The broadcast address (loopback in test mode) followed by each
    /// static peer address that parses; invalid entries are logged and
    /// skipped.
    fn destinations(&self) -> Vec<IpAddr> {
        let mut destinations: Vec<IpAddr> = vec![if self.test_mode {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::BROADCAST.into()
        }];
        for entry in self.store.custom_addresses() {
            match entry.parse::<IpAddr>() {
                Ok(addr) => destinations.push(addr),
                Err(_) => warn!("invalid static peer address {:?}", entry),
            }
        }
        destinations
    }

    async fn send_identity(&self, out: OutboundUdp<'_>, destinations: &[IpAddr]) {
        let packet = self.store.identity_packet().with_tcp_port(self.tcp_port);
        let payload = match packet.serialize() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot serialize identity packet: {}", err);
                return;
            }
        };

        for destination in destinations {
            let target = SocketAddr::new(*destination, self.broadcast_port);
            let Err(err) = out.send_to(&payload, target).await else {
                continue;
            };
            if !is_datagram_too_large(&err) {
                warn!("error sending identity datagram to {}: {}", target, err);
                continue;
            }
            // Broadcasts over the interface MTU get dropped on some
            // systems instead of fragmented. The capability sets are
            // the bulk of the payload, so resend without them.
            warn!(
                "identity datagram to {} rejected as too large, retrying without capabilities",
                target
            );
            let slim = packet.clone().without_capabilities();
            match slim.serialize() {
                Ok(slim_payload) => {
                    if let Err(err) = out.send_to(&slim_payload, target).await {
                        debug!("stripped identity resend to {} failed: {}", target, err);
                    }
                }
                Err(err) => debug!("cannot serialize stripped identity packet: {}", err),
            }
        }
    }

    /// Unicasts the local identity to a peer that could not be reached
    /// over TCP, inviting it to dial back.
    pub async fn send_reinvite(&self, peer: IpAddr) {
        let packet = self.store.identity_packet().with_tcp_port(self.tcp_port);
        let payload = match packet.serialize() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot serialize identity packet: {}", err);
                return;
            }
        };
        let target = SocketAddr::new(peer, self.broadcast_port);
        if let Err(err) = self.socket.send_to(&payload, target).await {
            warn!("error sending reinvitation to {}: {}", target, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::ipnetwork::{Ipv4Network, Ipv6Network};

    #[test]
    fn test_default_source_is_single_unbound_send() {
        assert!(DefaultSource.source_addrs().is_empty());
    }

    #[test]
    fn test_ipv4_source_filter_skips_loopback_and_v6() {
        let ips = vec![
            IpNetwork::V4(Ipv4Network::new(Ipv4Addr::new(127, 0, 0, 1), 8).unwrap()),
            IpNetwork::V4(Ipv4Network::new(Ipv4Addr::new(192, 168, 1, 20), 24).unwrap()),
            IpNetwork::V6(Ipv6Network::new("fe80::1".parse().unwrap(), 64).unwrap()),
        ];
        assert_eq!(ipv4_source_addrs(&ips), vec![Ipv4Addr::new(192, 168, 1, 20)]);
    }

    #[test]
    fn test_datagram_too_large_detection() {
        assert!(is_datagram_too_large(&io::Error::from_raw_os_error(EMSGSIZE)));
        assert!(!is_datagram_too_large(&io::Error::from_raw_os_error(13)));
        assert!(!is_datagram_too_large(&io::Error::new(
            io::ErrorKind::Other,
            "no os error"
        )));
    }
}
