//! Tokio-based LAN link provider.
//!
//! This crate lets two devices on the same local network find each
//! other and hand a mutually authenticated, encrypted byte stream to a
//! higher-level device-link layer:
//! - [`LanLinkProvider`] for discovery, rendezvous and TLS upgrade
//! - [`Link`] for the published encrypted stream
//! - [`IdentityStore`] for device identity, keys and pinned peers
//! - [`IdentityPacket`] for the wire-level identity announcement
//!
//! ## Features
//!
//! - UDP identity broadcast with static unicast destinations and
//!   MTU-limited retry
//! - Two-phase rendezvous with reverse-connection fallback when the
//!   initial dial fails
//! - TLS roles decoupled from TCP roles: the side that accepted the
//!   socket drives certificate verification as the TLS client
//! - Pinned-certificate verification for paired peers, self-signed
//!   acceptance for unpaired ones
//! - Deduplicated link bookkeeping with an unpaired-connection cap

pub mod config;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod registry;

mod broadcast;
mod netwatch;
mod tls;

pub use config::{DeviceInfo, IdentityStore, MemoryIdentityStore};
pub use error::{IdentityError, LanLinkError, Result};
pub use protocol::{DeviceType, IdentityPacket};
pub use provider::{LanLink, LanLinkProvider, LanLinkProviderConfig};
pub use registry::Link;
pub use tls::peer_device_id;
