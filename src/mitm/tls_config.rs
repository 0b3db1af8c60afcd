//! TLS Configuration for interception and upstream fetches
//!
//! - Client-facing TLS (proxy ← client) with issued per-host certificates
//! - A rejecting config used to fail handshakes cleanly
//! - Upstream TLS (proxy → origin) with webpki roots
//!
//! Only HTTP/1.1 is negotiated in either direction.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use webpki_roots::TLS_SERVER_ROOTS;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// Client-facing TLS config bound to one issued certificate
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert: CertificateDer<'static>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![cert], private_key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Config that completes no handshake.
    ///
    /// No certificate is ever resolved, so rustls aborts with a
    /// `handshake_failure` alert right after the ClientHello.
    pub fn rejecting() -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        Arc::new(config)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        debug!(sni = ?client_hello.server_name(), "Refusing handshake");
        None
    }
}

/// Upstream TLS config (proxy acts as client)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Verify origins against the Mozilla root bundle, or accept anything
    /// when `insecure` is set
    pub fn new(insecure: bool) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_root_certificates(root_store)
            .with_no_client_auth();

        // Recorded responses are replayed over HTTP/1.1
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        if insecure {
            error!("UPSTREAM TLS CERTIFICATE VERIFICATION DISABLED");
            error!("Recorded responses may come from an impersonated origin");
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerifier));
        }

        Self {
            config: Arc::new(config),
        }
    }

    /// Trust exactly `roots`. Used against local origins with a private CA.
    pub fn with_roots(roots: Vec<CertificateDer<'static>>) -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        for root in roots {
            root_store
                .add(root)
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }

        let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Accepts every upstream certificate
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
