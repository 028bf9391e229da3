//! TLS session material and content hashing.
//!
//! Every sender session issues a fresh self-signed certificate with an
//! ephemeral keypair; receivers skip peer verification. The security
//! model is opportunistic confidentiality on a trusted LAN. Content
//! integrity comes from the BLAKE3 footer digest, not from the
//! certificate.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use crate::error::{Result, TransferError};

/// Placeholder name presented during the handshake; it never takes
/// part in a trust decision because verification is disabled.
pub const TLS_SERVER_NAME: &str = "synapse.local";

/// Server config backed by a certificate and keypair generated for
/// this session only.
pub fn server_config() -> Result<Arc<ServerConfig>> {
    let issued = rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()])
        .map_err(|e| TransferError::Tls(e.to_string()))?;
    let cert = issued.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(issued.key_pair.serialize_der());
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key.into())?;
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate.
pub fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth();
    Arc::new(config)
}

pub fn server_name() -> Result<ServerName<'static>> {
    ServerName::try_from(TLS_SERVER_NAME.to_string()).map_err(|e| TransferError::Tls(e.to_string()))
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
