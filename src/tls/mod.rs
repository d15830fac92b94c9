//! TLS upgrade machinery.
//!
//! Both sides of a rendezvous present the local long-lived self-signed
//! certificate from the identity store. What the other side is checked
//! against depends on pairing state:
//!
//! - paired peer: the pinned certificate is the only acceptable one,
//!   and its common name must equal the expected device id
//!   ([`PinnedCertVerifier`]);
//! - unpaired peer: any currently valid self-issued certificate passes
//!   ([`SelfSignedVerifier`]); the presented certificate is captured
//!   from the connection afterwards for the publication check and a
//!   later pairing flow.
//!
//! The TCP-connecting side runs the server handshake and the accepting
//! side the client handshake, so each verifier is implemented for both
//! rustls verifier roles.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::IdentityStore;
use crate::error::Result;

fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Owned facts about an X.509 certificate needed for trust decisions.
pub(crate) struct CertInfo {
    pub subject_cn: Option<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub self_issued: bool,
}

pub(crate) fn certificate_info(der: &CertificateDer<'_>) -> Result<CertInfo> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| crate::error::LanLinkError::Certificate(e.to_string()))?;
    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    Ok(CertInfo {
        subject_cn,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        self_issued: cert.tbs_certificate.subject.as_raw() == cert.tbs_certificate.issuer.as_raw(),
    })
}

/// The device id a certificate claims, read from its subject common
/// name. A published link requires this to match the id from the
/// peer's identity packet.
pub fn peer_device_id(der: &CertificateDer<'_>) -> Option<String> {
    certificate_info(der).ok().and_then(|info| info.subject_cn)
}

fn parse(der: &CertificateDer<'_>) -> std::result::Result<CertInfo, rustls::Error> {
    certificate_info(der)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))
}

fn check_validity(info: &CertInfo, now: UnixTime) -> std::result::Result<(), rustls::Error> {
    let now = now.as_secs() as i64;
    if now < info.not_before {
        return Err(rustls::Error::InvalidCertificate(
            CertificateError::NotValidYet,
        ));
    }
    if now > info.not_after {
        return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
    }
    Ok(())
}

/// Verifier for paired peers: the presented certificate must be
/// byte-identical to the pinned one, currently valid, and carry the
/// expected device id as its common name.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    device_id: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    fn new(pinned: CertificateDer<'static>, device_id: &str) -> Self {
        Self {
            pinned,
            device_id: device_id.to_string(),
            algorithms: provider().signature_verification_algorithms,
        }
    }

    fn check(
        &self,
        end_entity: &CertificateDer<'_>,
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        if end_entity.as_ref() != self.pinned.as_ref() {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        let info = parse(end_entity)?;
        check_validity(&info, now)?;
        if info.subject_cn.as_deref() != Some(self.device_id.as_str()) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(())
    }
}

/// Verifier for unpaired peers. The handshake completes despite the
/// certificate being self-signed; only self-issuance is tolerated, so
/// a parse failure, an expired certificate or a real issuer chain all
/// stay fatal.
#[derive(Debug)]
struct SelfSignedVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SelfSignedVerifier {
    fn new() -> Self {
        Self {
            algorithms: provider().signature_verification_algorithms,
        }
    }

    fn check(
        &self,
        end_entity: &CertificateDer<'_>,
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let info = parse(end_entity)?;
        check_validity(&info, now)?;
        if !info.self_issued {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ));
        }
        Ok(())
    }
}

macro_rules! impl_verifier_pair {
    ($verifier:ty) => {
        impl ServerCertVerifier for $verifier {
            fn verify_server_cert(
                &self,
                end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                now: UnixTime,
            ) -> std::result::Result<ServerCertVerified, rustls::Error> {
                self.check(end_entity, now)?;
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls12_signature(message, cert, dss, &self.algorithms)
            }

            fn verify_tls13_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls13_signature(message, cert, dss, &self.algorithms)
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                self.algorithms.supported_schemes()
            }
        }

        impl ClientCertVerifier for $verifier {
            fn root_hint_subjects(&self) -> &[DistinguishedName] {
                &[]
            }

            fn verify_client_cert(
                &self,
                end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                now: UnixTime,
            ) -> std::result::Result<ClientCertVerified, rustls::Error> {
                self.check(end_entity, now)?;
                Ok(ClientCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls12_signature(message, cert, dss, &self.algorithms)
            }

            fn verify_tls13_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls13_signature(message, cert, dss, &self.algorithms)
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                self.algorithms.supported_schemes()
            }
        }
    };
}

impl_verifier_pair!(PinnedCertVerifier);
impl_verifier_pair!(SelfSignedVerifier);

fn server_verifier(
    store: &Arc<dyn IdentityStore>,
    remote_device_id: &str,
) -> Arc<dyn ServerCertVerifier> {
    match store.trusted_certificate(remote_device_id) {
        Some(pinned) => Arc::new(PinnedCertVerifier::new(pinned, remote_device_id)),
        None => Arc::new(SelfSignedVerifier::new()),
    }
}

fn client_verifier(
    store: &Arc<dyn IdentityStore>,
    remote_device_id: &str,
) -> Arc<dyn ClientCertVerifier> {
    match store.trusted_certificate(remote_device_id) {
        Some(pinned) => Arc::new(PinnedCertVerifier::new(pinned, remote_device_id)),
        None => Arc::new(SelfSignedVerifier::new()),
    }
}

/// Configuration for the server handshake run by the TCP-connecting
/// side. The peer must present a client certificate.
pub(crate) fn server_config(
    store: &Arc<dyn IdentityStore>,
    remote_device_id: &str,
) -> Result<ServerConfig> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(client_verifier(store, remote_device_id))
        .with_single_cert(vec![store.certificate()], store.private_key())?;
    Ok(config)
}

/// Configuration for the client handshake run by the TCP-accepting
/// side.
pub(crate) fn client_config(
    store: &Arc<dyn IdentityStore>,
    remote_device_id: &str,
) -> Result<ClientConfig> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(server_verifier(store, remote_device_id))
        .with_client_auth_cert(vec![store.certificate()], store.private_key())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceInfo, MemoryIdentityStore};
    use crate::protocol::DeviceType;
    use rcgen::{CertificateParams, DistinguishedName as RcgenDn, DnType, DnValue, KeyPair};

    fn store(id: &str) -> MemoryIdentityStore {
        MemoryIdentityStore::new(DeviceInfo {
            id: id.to_string(),
            name: "tls test".to_string(),
            device_type: DeviceType::Phone,
        })
        .unwrap()
    }

    fn dummy_name() -> ServerName<'static> {
        ServerName::try_from("peer").unwrap()
    }

    #[test]
    fn test_certificate_info_reads_common_name() {
        let store = store("97b1f5ff19f544a3a300f120e6838d6f");
        let info = certificate_info(&store.certificate()).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some("97b1f5ff19f544a3a300f120e6838d6f"));
        assert!(info.self_issued);
    }

    #[test]
    fn test_pinned_verifier_accepts_pinned_certificate() {
        let peer = store("2e7de4cfb89c4cd5a988ea5b2bb5f7ab");
        let verifier = PinnedCertVerifier::new(peer.certificate(), &peer.device_id());
        let result = ServerCertVerifier::verify_server_cert(
            &verifier,
            &peer.certificate(),
            &[],
            &dummy_name(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_pinned_verifier_rejects_other_certificate() {
        let peer = store("58b70d4fb0c447069c616f9a0f6700b1");
        let imposter = store("58b70d4fb0c447069c616f9a0f6700b1");
        let verifier = PinnedCertVerifier::new(peer.certificate(), &peer.device_id());
        let result = ServerCertVerifier::verify_server_cert(
            &verifier,
            &imposter.certificate(),
            &[],
            &dummy_name(),
            &[],
            UnixTime::now(),
        );
        assert!(matches!(
            result,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
    }

    #[test]
    fn test_self_signed_verifier_accepts_self_issued() {
        let peer = store("b4b9b79b24cc4f019cf02e67c9f5e3c3");
        let verifier = SelfSignedVerifier::new();
        let result = ClientCertVerifier::verify_client_cert(
            &verifier,
            &peer.certificate(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_self_signed_verifier_rejects_issued_certificate() {
        let issuer_key = KeyPair::generate().unwrap();
        let mut issuer_params = CertificateParams::default();
        issuer_params.distinguished_name = RcgenDn::new();
        issuer_params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String("issuer".into()));
        let issuer_cert = issuer_params.clone().self_signed(&issuer_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params.distinguished_name = RcgenDn::new();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String("leaf".into()));
        let leaf = leaf_params
            .signed_by(&leaf_key, &issuer_cert, &issuer_key)
            .unwrap();

        let verifier = SelfSignedVerifier::new();
        let result = ClientCertVerifier::verify_client_cert(
            &verifier,
            leaf.der(),
            &[],
            UnixTime::now(),
        );
        assert!(matches!(
            result,
            Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
        ));
    }

    #[test]
    fn test_config_builders() {
        let local: Arc<dyn IdentityStore> = Arc::new(store("27e5a8b4e61a4a309b46974a26c2cbef"));
        let peer = store("d0ba18c9f1e149118fbab3f2a0a26e08");
        // unpaired
        assert!(server_config(&local, &peer.device_id()).is_ok());
        assert!(client_config(&local, &peer.device_id()).is_ok());
    }
}
