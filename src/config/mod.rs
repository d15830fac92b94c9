//! Device identity and trust configuration.
//!
//! The provider reads everything it needs about the local device and
//! its peers through the [`IdentityStore`] capability: the local
//! identity and key material, the capability sets announced to peers,
//! the pinned certificates of trusted devices, and any user-declared
//! static peer addresses. Persistence is the embedder's concern;
//! [`MemoryIdentityStore`] is a complete in-memory implementation with
//! a generated self-signed certificate.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use rand::distr::Alphanumeric;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{LanLinkError, Result};
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::{DeviceType, IdentityPacket};

/// The local device as presented to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Globally unique, DNS-safe id. Must equal the certificate's
    /// common name; peers verify that binding after the handshake.
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
}

/// Read-only view of the persistent device configuration.
///
/// Passed explicitly into the broadcaster, the rendezvous engine and
/// the link registry. Writes (pairing a new device) happen outside this
/// crate.
pub trait IdentityStore: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    /// The local long-lived self-signed certificate.
    fn certificate(&self) -> CertificateDer<'static>;

    /// The private key matching [`certificate`](Self::certificate).
    fn private_key(&self) -> PrivateKeyDer<'static>;

    fn incoming_capabilities(&self) -> BTreeSet<String>;

    fn outgoing_capabilities(&self) -> BTreeSet<String>;

    /// The pinned certificate of a paired peer, if any.
    fn trusted_certificate(&self, device_id: &str) -> Option<CertificateDer<'static>>;

    fn is_trusted(&self, device_id: &str) -> bool {
        self.trusted_certificate(device_id).is_some()
    }

    /// User-declared static peer addresses, as entered. Entries that do
    /// not parse are skipped by the broadcaster.
    fn custom_addresses(&self) -> Vec<String> {
        Vec::new()
    }

    fn device_id(&self) -> String {
        self.device_info().id
    }

    /// The local identity as a wire packet, without a TCP port.
    fn identity_packet(&self) -> IdentityPacket {
        let info = self.device_info();
        IdentityPacket {
            device_id: info.id,
            device_name: info.name,
            device_type: info.device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: self.incoming_capabilities(),
            outgoing_capabilities: self.outgoing_capabilities(),
            tcp_port: None,
        }
    }
}

/// In-memory identity store backed by a generated certificate.
pub struct MemoryIdentityStore {
    info: DeviceInfo,
    certificate: CertificateDer<'static>,
    key_der: Vec<u8>,
    incoming: BTreeSet<String>,
    outgoing: BTreeSet<String>,
    trusted: RwLock<HashMap<String, CertificateDer<'static>>>,
    custom_addresses: Vec<String>,
}

impl MemoryIdentityStore {
    /// Creates a store for the given device, generating a fresh
    /// self-signed certificate whose common name is the device id.
    pub fn new(info: DeviceInfo) -> Result<Self> {
        let (certificate, key_der) = generate_self_signed(&info.id)?;
        Ok(Self {
            info,
            certificate,
            key_der,
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            trusted: RwLock::new(HashMap::new()),
            custom_addresses: Vec::new(),
        })
    }

    /// Creates a store with a random device id.
    pub fn generate(name: &str, device_type: DeviceType) -> Result<Self> {
        Self::new(DeviceInfo {
            id: generate_device_id(),
            name: name.to_string(),
            device_type,
        })
    }

    pub fn set_capabilities(&mut self, incoming: BTreeSet<String>, outgoing: BTreeSet<String>) {
        self.incoming = incoming;
        self.outgoing = outgoing;
    }

    pub fn set_custom_addresses(&mut self, addresses: Vec<String>) {
        self.custom_addresses = addresses;
    }

    /// Pins a peer certificate, marking the device as trusted.
    pub fn trust_peer(&self, device_id: &str, certificate: CertificateDer<'static>) {
        self.trusted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), certificate);
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn certificate(&self) -> CertificateDer<'static> {
        self.certificate.clone()
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    fn incoming_capabilities(&self) -> BTreeSet<String> {
        self.incoming.clone()
    }

    fn outgoing_capabilities(&self) -> BTreeSet<String> {
        self.outgoing.clone()
    }

    fn trusted_certificate(&self, device_id: &str) -> Option<CertificateDer<'static>> {
        self.trusted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    fn custom_addresses(&self) -> Vec<String> {
        self.custom_addresses.clone()
    }
}

/// Generates a 32-character lowercase alphanumeric device id. Ids in
/// this alphabet are valid DNS labels, so a peer's id can be used
/// directly as the TLS server name.
pub fn generate_device_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(32)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

fn generate_self_signed(device_id: &str) -> Result<(CertificateDer<'static>, Vec<u8>)> {
    let key = KeyPair::generate().map_err(|e| LanLinkError::Certificate(e.to_string()))?;
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(
        DnType::CommonName,
        DnValue::Utf8String(device_id.to_string()),
    );
    let cert = params
        .self_signed(&key)
        .map_err(|e| LanLinkError::Certificate(e.to_string()))?;
    Ok((cert.der().clone(), key.serialize_der()))
}
