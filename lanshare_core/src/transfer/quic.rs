//! QUIC endpoints for the control/data channel.
//!
//! The server presents a throwaway self-signed certificate and the client
//! accepts any certificate: TLS here is only the framing QUIC requires, not
//! peer authentication.

use crate::error::{ShareError, ShareResult};
use quinn::{ClientConfig, Endpoint, ServerConfig, TransportConfig};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;

use super::constants::{ALPN, IDLE_TIMEOUT};

/// Install the ring provider for rustls (0.23+ wants one process-wide).
/// Losing the race to another installer is fine.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Generate a self-signed certificate for QUIC
pub fn generate_self_signed_cert()
-> anyhow::Result<(Vec<CertificateDer<'static>>, PrivatePkcs8KeyDer<'static>)> {
    let certified_key = generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    Ok((vec![cert_der], key))
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(IDLE_TIMEOUT.try_into()?));
    transport_config.keep_alive_interval(Some(IDLE_TIMEOUT / 3));
    transport_config.max_concurrent_bidi_streams(64u32.into());
    Ok(transport_config)
}

fn build_server_config() -> anyhow::Result<ServerConfig> {
    let (certs, key) = generate_self_signed_cert()?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

fn build_client_config() -> anyhow::Result<ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));
    Ok(client_config)
}

/// Create the server endpoint. Failure here is fatal for the server role.
pub fn make_server_endpoint(bind_addr: SocketAddr) -> ShareResult<Endpoint> {
    ensure_crypto_provider();
    let server_config = build_server_config().map_err(|e| ShareError::Bind {
        what: "transfer endpoint",
        source: std::io::Error::other(e.to_string()),
    })?;

    Endpoint::server(server_config, bind_addr).map_err(|source| ShareError::Bind {
        what: "transfer endpoint",
        source,
    })
}

/// Create a client endpoint on an ephemeral port
pub fn make_client_endpoint() -> ShareResult<Endpoint> {
    ensure_crypto_provider();
    let client_config = build_client_config().map_err(|e| ShareError::Bind {
        what: "client endpoint",
        source: std::io::Error::other(e.to_string()),
    })?;

    let mut endpoint =
        Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))).map_err(|source| {
            ShareError::Bind {
                what: "client endpoint",
                source,
            }
        })?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// Certificate verifier that accepts anything (self-signed peers on a LAN)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
