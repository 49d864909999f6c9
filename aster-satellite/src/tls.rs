use std::sync::Arc;

use anyhow::Context as _;
use tokio_rustls::rustls;

use crate::identity::Identity;

/// ALPN protocol advertised on the QUIC endpoint.
pub const QUIC_ALPN: &[u8] = b"arpc";

/// Builds the rustls server configuration used by both the TLS route of the
/// public stream listener and the QUIC endpoint.
pub fn build_server_config(identity: &Identity) -> anyhow::Result<rustls::ServerConfig> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key().clone_key())
        .context("failed to build TLS server config")?;

    Ok(config)
}

pub fn build_quic_server_config(identity: &Identity) -> anyhow::Result<quinn::ServerConfig> {
    let mut tls_config = build_server_config(identity)?;
    tls_config.alpn_protocols = vec![QUIC_ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .context("TLS config is not usable for QUIC")?;

    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

pub mod danger {
    use std::sync::Arc;

    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Test dials and loopback diagnostics
    /// only; peers of a satellite pin the node identity out-of-band.
    #[derive(Debug)]
    pub struct NoCertificateVerification(rustls::crypto::CryptoProvider);

    impl NoCertificateVerification {
        pub fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl Default for NoCertificateVerification {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Client configuration that skips certificate verification.
    pub fn client_config() -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
            .with_no_client_auth()
    }
}
