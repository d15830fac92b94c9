//! Per-connection rendezvous state machine.
//!
//! Every TCP socket between accept/connect and link publication is
//! driven through an explicit phase machine. Two flows converge on the
//! same encrypted stream:
//!
//! - received a UDP identity → `Dialing` → `WritingIdentity` →
//!   `TlsServerHandshake` (we connected the socket, so we run the TLS
//!   *server* side);
//! - accepted a TCP socket → `AwaitingIdentity` → `TlsClientHandshake`
//!   (the peer connected to us, so we run the TLS *client* side and
//!   verify the certificate of the device we just learned about).
//!
//! A failed dial or a failed identity write triggers the reverse
//! fallback: the local identity is unicast back to the announcer,
//! inviting it to connect in the other direction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, ServerName};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::config::IdentityStore;
use crate::error::{LanLinkError, Result};
use crate::protocol::constants::{IDENTITY_READ_TIMEOUT, MAX_IDENTITY_LINE};
use crate::protocol::IdentityPacket;
use crate::tls;

/// The encrypted stream handed to the link registry.
pub(crate) type LinkStream = TlsStream<TcpStream>;

/// Everything a handshake task needs from the provider.
pub(crate) struct ConnCtx {
    pub store: Arc<dyn IdentityStore>,
    pub broadcaster: Arc<Broadcaster>,
}

/// An encrypted, authenticated connection ready for publication.
pub(crate) struct ReadyConnection {
    pub stream: LinkStream,
    pub identity: IdentityPacket,
    pub peer_certificate: CertificateDer<'static>,
}

pub(crate) enum Phase {
    Dialing {
        remote: IdentityPacket,
        peer: SocketAddr,
    },
    WritingIdentity {
        stream: TcpStream,
        remote: IdentityPacket,
        peer: SocketAddr,
    },
    AwaitingIdentity {
        stream: TcpStream,
        peer: SocketAddr,
    },
    TlsServerHandshake {
        stream: TcpStream,
        remote: IdentityPacket,
    },
    TlsClientHandshake {
        stream: TcpStream,
        remote: IdentityPacket,
    },
    Ready(Box<ReadyConnection>),
    Dead,
}

/// Drives one connection to a terminal phase. `None` means the socket
/// died somewhere along the way and has been dropped.
pub(crate) async fn run(ctx: &ConnCtx, mut phase: Phase) -> Option<ReadyConnection> {
    loop {
        phase = match phase {
            Phase::Ready(ready) => return Some(*ready),
            Phase::Dead => return None,
            live => step(ctx, live).await,
        };
    }
}

async fn step(ctx: &ConnCtx, phase: Phase) -> Phase {
    match phase {
        Phase::Dialing { remote, peer } => {
            let Some(port) = remote.tcp_port else {
                return Phase::Dead;
            };
            match TcpStream::connect((peer.ip(), port)).await {
                Ok(stream) => {
                    configure_socket(&stream);
                    Phase::WritingIdentity {
                        stream,
                        remote,
                        peer,
                    }
                }
                Err(err) => {
                    debug!(
                        "connecting to {}:{} failed ({}), inviting a reverse connection",
                        peer.ip(),
                        port,
                        err
                    );
                    ctx.broadcaster.send_reinvite(peer.ip()).await;
                    Phase::Dead
                }
            }
        }

        Phase::WritingIdentity {
            mut stream,
            remote,
            peer,
        } => {
            let line = match ctx.store.identity_packet().serialize() {
                Ok(line) => line,
                Err(err) => {
                    warn!("cannot serialize local identity: {}", err);
                    return Phase::Dead;
                }
            };
            match write_line(&mut stream, &line).await {
                Ok(()) => Phase::TlsServerHandshake { stream, remote },
                Err(err) => {
                    debug!(
                        "identity write to {} did not flush ({}), inviting a reverse connection",
                        peer, err
                    );
                    ctx.broadcaster.send_reinvite(peer.ip()).await;
                    Phase::Dead
                }
            }
        }

        Phase::AwaitingIdentity { mut stream, peer } => {
            configure_socket(&stream);
            match timeout(IDENTITY_READ_TIMEOUT, read_identity_line(&mut stream)).await {
                Ok(Ok(remote)) => Phase::TlsClientHandshake { stream, remote },
                Ok(Err(err)) => {
                    warn!("closing connection from {}: {}", peer, err);
                    Phase::Dead
                }
                Err(_) => {
                    warn!("host {} timed out without sending an identity", peer);
                    Phase::Dead
                }
            }
        }

        Phase::TlsServerHandshake { stream, remote } => {
            let config = match tls::server_config(&ctx.store, &remote.device_id) {
                Ok(config) => config,
                Err(err) => {
                    warn!("cannot build TLS server config: {}", err);
                    return Phase::Dead;
                }
            };
            match TlsAcceptor::from(Arc::new(config)).accept(stream).await {
                Ok(stream) => encrypted(TlsStream::from(stream), remote),
                Err(err) => {
                    warn!(
                        "TLS handshake with {} failed: {}",
                        remote.device_id, err
                    );
                    Phase::Dead
                }
            }
        }

        Phase::TlsClientHandshake { stream, remote } => {
            let config = match tls::client_config(&ctx.store, &remote.device_id) {
                Ok(config) => config,
                Err(err) => {
                    warn!("cannot build TLS client config: {}", err);
                    return Phase::Dead;
                }
            };
            let server_name = match ServerName::try_from(remote.device_id.clone()) {
                Ok(name) => name,
                Err(_) => {
                    warn!(
                        "peer device id {:?} is not usable as a server name",
                        remote.device_id
                    );
                    return Phase::Dead;
                }
            };
            match TlsConnector::from(Arc::new(config))
                .connect(server_name, stream)
                .await
            {
                Ok(stream) => encrypted(TlsStream::from(stream), remote),
                Err(err) => {
                    warn!(
                        "TLS handshake with {} failed: {}",
                        remote.device_id, err
                    );
                    Phase::Dead
                }
            }
        }

        terminal => terminal,
    }
}

fn encrypted(stream: LinkStream, identity: IdentityPacket) -> Phase {
    let peer_certificate = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .cloned();
    match peer_certificate {
        Some(peer_certificate) => Phase::Ready(Box::new(ReadyConnection {
            stream,
            identity,
            peer_certificate,
        })),
        None => {
            warn!("{} presented no certificate", identity.device_id);
            Phase::Dead
        }
    }
}

async fn write_line(stream: &mut TcpStream, line: &[u8]) -> std::io::Result<()> {
    stream.write_all(line).await?;
    stream.flush().await
}

/// Reads the single identity line a peer must send before TLS.
/// Anything over the size limit, trailing plaintext after the line, or
/// a close without a full line is an error and tears the socket down.
pub(crate) async fn read_identity_line<S>(stream: &mut S) -> Result<IdentityPacket>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(LanLinkError::ConnectionClosed);
        }
        if buf.len() > MAX_IDENTITY_LINE {
            return Err(LanLinkError::IdentityTooLong(buf.len()));
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos + 1 < buf.len() {
                return Err(LanLinkError::UnexpectedPlaintext);
            }
            return Ok(IdentityPacket::parse(&buf[..=pos])?);
        }
    }
}

/// The device-link layer has no application-level ping; it relies on
/// the kernel noticing dead peers, so keepalive is not optional.
fn configure_socket(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_interval(Duration::from_secs(5));
    #[cfg(unix)]
    let keepalive = keepalive
        .with_time(Duration::from_secs(10))
        .with_retries(3);
    #[cfg(windows)]
    let keepalive = keepalive.with_time(Duration::from_secs(300));

    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("could not enable TCP keepalive: {}", err);
    }
}
