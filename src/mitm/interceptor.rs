//! TLS Interceptor - SNI-driven server-side handshake
//!
//! The certificate is chosen while the handshake is in progress: the
//! ClientHello is read first, a certificate is issued for its SNI hostname,
//! and only then is the server configuration fixed. The result is a
//! plaintext stream that the HTTP layer can serve like any other connection.
//!
//! Handshake progress per connection:
//!
//! ```text
//! AwaitClientHello -> AwaitSniCallback -> ContextSwapped -> HandshakeComplete
//!                              \________________\__________-> Failed
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{LazyConfigAcceptor, StartHandshake};
use tracing::{debug, error, info};

use super::certificate_authority::CertificateIssuer;
use super::error::MitmError;
use super::tls_config::ClientTlsConfig;

/// Interception errors
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Client sent no SNI hostname")]
    SniMissing,

    #[error("Failed to read ClientHello: {0}")]
    ClientHello(io::Error),

    #[error("No certificate for {host}: {source}")]
    Certificate { host: String, source: MitmError },

    #[error("TLS handshake failed for {host}: {source}")]
    Handshake { host: String, source: io::Error },
}

/// Per-connection handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitClientHello,
    AwaitSniCallback,
    ContextSwapped,
    HandshakeComplete,
    Failed,
}

struct HandshakeTracker {
    state: HandshakeState,
}

impl HandshakeTracker {
    fn new() -> Self {
        Self {
            state: HandshakeState::AwaitClientHello,
        }
    }

    fn advance(&mut self, next: HandshakeState, host: Option<&str>) {
        debug!(from = ?self.state, to = ?next, host = ?host, "Handshake state");
        self.state = next;
    }
}

/// Terminates client TLS with certificates issued on demand
pub struct TlsInterceptor {
    issuer: Arc<dyn CertificateIssuer>,
    rejecting: Arc<ServerConfig>,
}

impl TlsInterceptor {
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            issuer,
            rejecting: ClientTlsConfig::rejecting(),
        }
    }

    /// Complete the server side of a handshake on `stream`.
    ///
    /// The issuer is asked for a certificate exactly once, for the SNI
    /// hostname. When there is no hostname or no certificate, the handshake
    /// is failed with an alert to the client rather than dropped mid-flight.
    pub async fn accept<S>(&self, stream: S) -> Result<InterceptedStream<S>, InterceptError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut tracker = HandshakeTracker::new();

        let start = match LazyConfigAcceptor::new(Acceptor::default(), stream).await {
            Ok(start) => start,
            Err(e) => {
                tracker.advance(HandshakeState::Failed, None);
                debug!(error = %e, "Failed to read ClientHello");
                return Err(InterceptError::ClientHello(e));
            }
        };
        tracker.advance(HandshakeState::AwaitSniCallback, None);

        let sni = start.client_hello().server_name().map(str::to_string);
        let host = match sni {
            Some(name) => name,
            None => {
                error!("Dropping request without SNI");
                tracker.advance(HandshakeState::Failed, None);
                self.reject(start).await;
                return Err(InterceptError::SniMissing);
            }
        };

        let config = match self.server_config_for(&host).await {
            Ok(config) => config,
            Err(e) => {
                error!(host = %host, error = %e, "Failed to issue certificate, failing handshake");
                tracker.advance(HandshakeState::Failed, Some(&host));
                self.reject(start).await;
                return Err(InterceptError::Certificate { host, source: e });
            }
        };
        tracker.advance(HandshakeState::ContextSwapped, Some(&host));

        match start.into_stream(config).await {
            Ok(tls) => {
                tracker.advance(HandshakeState::HandshakeComplete, Some(&host));
                info!(host = %host, "Client TLS handshake successful");
                Ok(InterceptedStream::new(tls, host))
            }
            Err(e) => {
                tracker.advance(HandshakeState::Failed, Some(&host));
                debug!(host = %host, error = %e, "Client TLS handshake failed");
                Err(InterceptError::Handshake { host, source: e })
            }
        }
    }

    async fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, MitmError> {
        let cert = self.issuer.issue_certificate(host).await?;
        let config = ClientTlsConfig::new(cert, self.issuer.private_key())
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;
        Ok(config.server_config())
    }

    /// Let rustls fail the handshake and flush its alert
    async fn reject<S>(&self, start: StartHandshake<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = start.into_stream(Arc::clone(&self.rejecting)).await {
            debug!(error = %e, "Handshake rejected");
        }
    }
}

/// Decrypted client stream.
///
/// A client that closes its socket without `close_notify`, or resets it,
/// reads as an ordinary end of stream.
pub struct InterceptedStream<S> {
    inner: TlsStream<S>,
    server_name: String,
}

impl<S> InterceptedStream<S> {
    fn new(inner: TlsStream<S>, server_name: String) -> Self {
        Self { inner, server_name }
    }

    /// SNI hostname the certificate was issued for
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn get_ref(&self) -> &TlsStream<S> {
        &self.inner
    }
}

fn is_ragged_close(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl<S> AsyncRead for InterceptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(e)) if is_ragged_close(e.kind()) => {
                debug!(host = %this.server_name, error = %e, "Ragged close treated as EOF");
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for InterceptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_close_kinds() {
        assert!(is_ragged_close(io::ErrorKind::UnexpectedEof));
        assert!(is_ragged_close(io::ErrorKind::ConnectionReset));
        assert!(is_ragged_close(io::ErrorKind::ConnectionAborted));
        assert!(!is_ragged_close(io::ErrorKind::InvalidData));
    }

    #[test]
    fn test_tracker_starts_awaiting_client_hello() {
        let mut tracker = HandshakeTracker::new();
        assert_eq!(tracker.state, HandshakeState::AwaitClientHello);
        tracker.advance(HandshakeState::Failed, Some("a.com"));
        assert_eq!(tracker.state, HandshakeState::Failed);
    }
}
