//! TLS interception tests
//!
//! Client and interceptor talk over an in-memory duplex pipe. The client
//! trusts only the test CA, so a completed handshake proves the issued leaf
//! chains to it and matches the SNI name.

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_rustls::TlsConnector;
use webreplay::mitm::{
    CertificateAuthority, CertificateIssuer, InterceptError, MitmError, TlsInterceptor, UpstreamTlsConfig,
};

/// Delegates to a real CA, remembering every hostname asked for
struct CountingIssuer {
    ca: CertificateAuthority,
    calls: AtomicUsize,
    hosts: Mutex<Vec<String>>,
}

impl CountingIssuer {
    fn new() -> Self {
        Self {
            ca: CertificateAuthority::generate(16).unwrap(),
            calls: AtomicUsize::new(0),
            hosts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CertificateIssuer for CountingIssuer {
    async fn issue_certificate(&self, hostname: &str) -> Result<CertificateDer<'static>, MitmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hosts.lock().unwrap().push(hostname.to_string());
        self.ca.issue_certificate(hostname).await
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        self.ca.private_key()
    }
}

/// Never produces a certificate
struct FailingIssuer {
    key: PrivateKeyDer<'static>,
}

#[async_trait]
impl CertificateIssuer for FailingIssuer {
    async fn issue_certificate(&self, hostname: &str) -> Result<CertificateDer<'static>, MitmError> {
        Err(MitmError::cert_generation(hostname, "CA unavailable"))
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

fn connector_trusting(ca: &CertificateAuthority) -> TlsConnector {
    let upstream = UpstreamTlsConfig::with_roots(vec![ca.ca_cert_der()]).unwrap();
    TlsConnector::from(upstream.client_config())
}

fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(64 * 1024)
}

#[tokio::test]
async fn test_sni_drives_single_issuance() {
    let issuer = Arc::new(CountingIssuer::new());
    let connector = connector_trusting(&issuer.ca);
    let interceptor = TlsInterceptor::new(Arc::clone(&issuer) as Arc<dyn CertificateIssuer>);
    let (client_io, server_io) = pipe();

    let server_name = ServerName::try_from("h.example").unwrap();
    let (client, server) = tokio::join!(
        connector.connect(server_name, client_io),
        interceptor.accept(server_io)
    );

    let mut client = client.expect("client handshake");
    let mut server = server.expect("server handshake");

    assert_eq!(server.server_name(), "h.example");
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*issuer.hosts.lock().unwrap(), vec!["h.example".to_string()]);

    // Plaintext flows both ways
    client.write_all(b"ping").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server.write_all(b"pong").await.unwrap();
    server.flush().await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_issuer_failure_fails_handshake_cleanly() {
    let ca = CertificateAuthority::generate(16).unwrap();
    let connector = connector_trusting(&ca);
    let interceptor = TlsInterceptor::new(Arc::new(FailingIssuer { key: ca.private_key() }));
    let (client_io, server_io) = pipe();

    let server_name = ServerName::try_from("h.example").unwrap();
    let (client, server) = tokio::join!(
        connector.connect(server_name, client_io),
        interceptor.accept(server_io)
    );

    match server {
        Err(InterceptError::Certificate { host, .. }) => assert_eq!(host, "h.example"),
        Err(other) => panic!("expected Certificate error, got {}", other),
        Ok(_) => panic!("handshake should have failed"),
    }
    assert!(client.is_err());
}

#[tokio::test]
async fn test_missing_sni_rejected() {
    let issuer = Arc::new(CountingIssuer::new());
    let connector = connector_trusting(&issuer.ca);
    let interceptor = TlsInterceptor::new(Arc::clone(&issuer) as Arc<dyn CertificateIssuer>);
    let (client_io, server_io) = pipe();

    // IP address server names are never sent as SNI
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    let (client, server) = tokio::join!(
        connector.connect(server_name, client_io),
        interceptor.accept(server_io)
    );

    assert!(matches!(server, Err(InterceptError::SniMissing)));
    assert!(client.is_err());
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_garbage_client_hello() {
    let interceptor = TlsInterceptor::new(Arc::new(CountingIssuer::new()));
    let (mut client_io, server_io) = pipe();

    let client = async move {
        client_io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client_io
    };
    let (_client_io, server) = tokio::join!(client, interceptor.accept(server_io));

    assert!(matches!(server, Err(InterceptError::ClientHello(_))));
}

#[tokio::test]
async fn test_ragged_eof_reads_as_end_of_stream() {
    let issuer = Arc::new(CountingIssuer::new());
    let connector = connector_trusting(&issuer.ca);
    let interceptor = TlsInterceptor::new(Arc::clone(&issuer) as Arc<dyn CertificateIssuer>);
    let (client_io, server_io) = pipe();

    let server_name = ServerName::try_from("ragged.example").unwrap();
    let (client, server) = tokio::join!(
        connector.connect(server_name, client_io),
        interceptor.accept(server_io)
    );
    let client = client.unwrap();
    let mut server = server.unwrap();

    // Drop the transport without close_notify
    let (raw, _session) = client.into_inner();
    drop(raw);

    let mut buf = [0u8; 16];
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_ca_cache_reuses_leaf_across_connections() {
    let ca = Arc::new(CertificateAuthority::generate(16).unwrap());
    let connector = connector_trusting(&ca);
    let interceptor = TlsInterceptor::new(Arc::clone(&ca) as Arc<dyn CertificateIssuer>);

    for _ in 0..2 {
        let (client_io, server_io) = pipe();
        let server_name = ServerName::try_from("Cached.Example").unwrap();
        let (client, server) = tokio::join!(
            connector.connect(server_name, client_io),
            interceptor.accept(server_io)
        );
        assert!(client.is_ok());
        assert!(server.is_ok());
    }

    let (cached, _) = ca.cache_stats().await;
    assert_eq!(cached, 1);
}
