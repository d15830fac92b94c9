//! Constants for the LAN link protocol.

use std::time::Duration;

/// Type tag carried by every identity record.
pub const PACKET_TYPE_IDENTITY: &str = "lanlink.identity";

/// Version of the link protocol spoken by this crate.
/// Carried in every identity packet; not enforced on receive.
pub const PROTOCOL_VERSION: u32 = 1;

/// First TCP port the acceptor tries to bind.
pub const MIN_TCP_PORT: u16 = 1716;

/// Last TCP port the acceptor tries before giving up.
pub const MAX_TCP_PORT: u16 = 1764;

/// Default UDP port for identity broadcasts and the listener.
pub const DEFAULT_UDP_PORT: u16 = 1716;

/// Maximum bytes a peer may send before TLS starts.
/// The identity line must fit; anything longer is treated as hostile.
pub const MAX_IDENTITY_LINE: usize = 8192;

/// How long an accepted socket may stay silent before it is closed.
pub const IDENTITY_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Live-link limit for peers we have no pairing with. This is an
/// inclusive upper bound: the 43rd unpaired link is refused.
pub const MAX_UNPAIRED_CONNECTIONS: usize = 42;

/// Outstanding handshake limit, inclusive. Datagrams and accepted
/// sockets arriving while the table is full are dropped with a warning.
pub const MAX_REMEMBERED_IDENTITY_PACKETS: usize = 42;

/// Setting this environment variable (to any value) disables all UDP
/// identity sends from the broadcaster, including unicasts to static
/// peer addresses.
pub const DISABLE_UDP_BROADCAST_ENV: &str = "KDECONNECT_DISABLE_UDP_BROADCAST";
