//! Wire protocol for LAN link discovery.

pub mod constants;
pub mod identity;

pub use identity::{DeviceType, IdentityPacket};
