//! Identity packet codec.
//!
//! An identity record is a single-line JSON envelope: a numeric `id`
//! (milliseconds since the epoch), the type tag, and the identity body.
//! The trailing `\n` makes the encoded packet one "line" on a TCP
//! stream, so a receiver can frame it with a read-line primitive. The
//! same encoding is used for UDP datagrams and for the pre-TLS exchange
//! on TCP, except that the TCP form omits `tcpPort`.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::constants::{MAX_TCP_PORT, MIN_TCP_PORT, PACKET_TYPE_IDENTITY};
use crate::error::IdentityError;

/// Broad category of the announcing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl<'de> Deserialize<'de> for DeviceType {
    /// Unknown values on the wire parse as desktop, so new device
    /// categories do not break discovery with older peers.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let kind = String::deserialize(deserializer)?;
        Ok(match kind.as_str() {
            "laptop" => DeviceType::Laptop,
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        })
    }
}

/// Identity announcement exchanged over UDP and as the first line of a
/// TCP stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPacket {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub device_type: DeviceType,
    pub protocol_version: u32,
    #[serde(default)]
    pub incoming_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub outgoing_capabilities: BTreeSet<String>,
    /// Port the announcer's TCP acceptor listens on. Present in UDP
    /// announcements; omitted in the identity written over TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    id: u64,
    #[serde(rename = "type")]
    packet_type: String,
    body: IdentityPacket,
}

impl IdentityPacket {
    /// Encodes the packet as one newline-terminated JSON line.
    pub fn serialize(&self) -> Result<Vec<u8>, IdentityError> {
        let envelope = Envelope {
            id: unix_millis(),
            packet_type: PACKET_TYPE_IDENTITY.to_string(),
            body: self.clone(),
        };
        let mut out = serde_json::to_vec(&envelope)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Decodes one line. Rejects records whose type tag is not the
    /// identity type and reports a structural error for truncated or
    /// otherwise malformed input.
    pub fn parse(data: &[u8]) -> Result<Self, IdentityError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.packet_type != PACKET_TYPE_IDENTITY {
            return Err(IdentityError::WrongType {
                expected: PACKET_TYPE_IDENTITY,
                found: envelope.packet_type,
            });
        }
        Ok(envelope.body)
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Drops both capability sets. Used when a datagram was rejected as
    /// too large and is resent in a slimmer form.
    pub fn without_capabilities(mut self) -> Self {
        self.incoming_capabilities.clear();
        self.outgoing_capabilities.clear();
        self
    }

    /// Whether the announced TCP port is inside the acceptor range.
    pub fn has_valid_tcp_port(&self) -> bool {
        matches!(self.tcp_port, Some(p) if (MIN_TCP_PORT..=MAX_TCP_PORT).contains(&p))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IdentityPacket {
        IdentityPacket {
            device_id: "3fdc51a20bff4a5c9a64ab37ca581f27".to_string(),
            device_name: "workstation".to_string(),
            device_type: DeviceType::Desktop,
            protocol_version: 1,
            incoming_capabilities: ["ping", "share"].iter().map(|s| s.to_string()).collect(),
            outgoing_capabilities: ["ping"].iter().map(|s| s.to_string()).collect(),
            tcp_port: Some(1716),
        }
    }

    #[test]
    fn test_roundtrip() {
        let packet = sample();
        let encoded = packet.serialize().unwrap();
        let decoded = IdentityPacket::parse(&encoded).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_single_trailing_terminator() {
        let encoded = sample().serialize().unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        let terminators = encoded.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(terminators, 1);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let line = br#"{"id":7,"type":"lanlink.pair","body":{"deviceId":"x","deviceName":"x","protocolVersion":1}}"#;
        match IdentityPacket::parse(line) {
            Err(IdentityError::WrongType { found, .. }) => assert_eq!(found, "lanlink.pair"),
            other => panic!("expected WrongType, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let mut encoded = sample().serialize().unwrap();
        encoded.truncate(encoded.len() / 2);
        assert!(matches!(
            IdentityPacket::parse(&encoded),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn test_tcp_port_optional_on_wire() {
        let mut packet = sample();
        packet.tcp_port = None;
        let encoded = packet.serialize().unwrap();
        assert!(!String::from_utf8(encoded.clone()).unwrap().contains("tcpPort"));
        assert_eq!(IdentityPacket::parse(&encoded).unwrap().tcp_port, None);
    }

    #[test]
    fn test_tcp_port_range() {
        assert!(sample().has_valid_tcp_port());
        assert!(!sample().with_tcp_port(MIN_TCP_PORT - 1).has_valid_tcp_port());
        assert!(!sample().with_tcp_port(MAX_TCP_PORT + 1).has_valid_tcp_port());
        let mut packet = sample();
        packet.tcp_port = None;
        assert!(!packet.has_valid_tcp_port());
    }

    #[test]
    fn test_unknown_device_type_parses_as_desktop() {
        let line = br#"{"id":1,"type":"lanlink.identity","body":{"deviceId":"x","deviceName":"x","deviceType":"fridge","protocolVersion":1}}"#;
        let packet = IdentityPacket::parse(line).unwrap();
        assert_eq!(packet.device_type, DeviceType::Desktop);
    }

    #[test]
    fn test_without_capabilities() {
        let slim = sample().without_capabilities();
        assert!(slim.incoming_capabilities.is_empty());
        assert!(slim.outgoing_capabilities.is_empty());
        assert_eq!(slim.device_id, sample().device_id);
    }
}
