//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Certificate authority errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Hostname cannot be put in a certificate
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_generation_message() {
        let err = MitmError::cert_generation("a.com", "bad key");
        assert_eq!(err.to_string(), "Failed to generate certificate for a.com: bad key");
        assert!(std::error::Error::source(&err).is_none());
    }
}
