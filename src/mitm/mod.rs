//! TLS interception
//!
//! - Certificate authority minting per-host leaf certificates
//! - SNI-driven server handshake producing a plaintext stream
//! - TLS configurations for both the client side and upstream fetches

pub mod certificate_authority;
pub mod error;
pub mod interceptor;
pub mod tls_config;

pub use certificate_authority::{CertificateAuthority, CertificateIssuer};
pub use error::MitmError;
pub use interceptor::{HandshakeState, InterceptError, InterceptedStream, TlsInterceptor};
pub use tls_config::{ClientTlsConfig, TlsConfigError, UpstreamTlsConfig};
