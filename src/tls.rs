use rustls::pki_types::CertificateDer;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::path::Path;

use crate::mitm::MitmError;

/// CA certificate and key, both PEM encoded
#[derive(Debug, Clone)]
pub struct CaPem {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Read a CA certificate and private key from PEM files.
///
/// Both files are checked to contain what they claim before being handed to
/// the certificate authority.
pub fn load_ca_pem(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<CaPem, MitmError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read_to_string(cert_path)?;
    if certs_from_pem(&cert_pem)?.is_empty() {
        return Err(MitmError::ca_load(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_pem = std::fs::read_to_string(key_path)?;
    let mut key_reader = BufReader::new(key_pem.as_bytes());
    if private_key(&mut key_reader)?.is_none() {
        return Err(MitmError::ca_load(format!(
            "No private keys found in {}",
            key_path.display()
        )));
    }

    Ok(CaPem { cert_pem, key_pem })
}

/// DER certificates contained in a PEM string
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, MitmError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let parsed = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(parsed)
}
