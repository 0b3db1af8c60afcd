//! Certificate Authority - per-host certificates for TLS interception
//!
//! Every intercepted host gets a leaf certificate signed by the proxy CA.
//! All leaves share one private key, so a handshake only needs the
//! certificate itself. Issued certificates are cached with a TTL.

use async_trait::async_trait;
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::MitmError;
use crate::tls::load_ca_pem;

const DEFAULT_CERT_TTL: Duration = Duration::from_secs(86400);
const CA_COMMON_NAME: &str = "webreplay CA";

/// Certificate issuing capability used by the TLS interceptor
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Leaf certificate for `hostname`, signed by the CA
    async fn issue_certificate(&self, hostname: &str) -> Result<CertificateDer<'static>, MitmError>;

    /// Private key matching every issued leaf
    fn private_key(&self) -> PrivateKeyDer<'static>;
}

/// Cached certificate with TTL
struct CachedCertificate {
    cert: CertificateDer<'static>,
    created_at: Instant,
}

impl CachedCertificate {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Proxy CA with an LRU cache of issued leaves
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// PEM as loaded or generated; what clients must trust
    ca_cert_pem: String,
    leaf_key: KeyPair,
    cache: Mutex<LruCache<String, CachedCertificate>>,
    max_cache_size: usize,
    cert_ttl: Duration,
}

impl CertificateAuthority {
    /// Create a fresh CA
    pub fn generate(max_cache_size: usize) -> Result<Self, MitmError> {
        let ca_key = KeyPair::generate().map_err(|e| MitmError::ca_generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "webreplay");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_generation(e.to_string()))?;
        let ca_cert_pem = ca_cert.pem();

        info!("Generated new CA certificate");
        Self::assemble(ca_cert, ca_key, ca_cert_pem, max_cache_size)
    }

    /// Create from an existing CA certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str, max_cache_size: usize) -> Result<Self, MitmError> {
        let ca_key = KeyPair::from_pem(key_pem).map_err(|e| MitmError::ca_load(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(e.to_string()))?;

        // Re-signing keeps subject and key, which is all leaf signing needs
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_load(e.to_string()))?;

        Self::assemble(ca_cert, ca_key, cert_pem.to_string(), max_cache_size)
    }

    /// Load the CA from PEM files
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        max_cache_size: usize,
    ) -> Result<Self, MitmError> {
        let pem = load_ca_pem(cert_path.as_ref(), key_path.as_ref())?;
        let ca = Self::from_pem(&pem.cert_pem, &pem.key_pem, max_cache_size)?;
        info!(path = %cert_path.as_ref().display(), "Loaded CA certificate");
        Ok(ca)
    }

    /// Load the CA if both files exist, otherwise generate one and save it
    pub fn load_or_generate(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        max_cache_size: usize,
    ) -> Result<Self, MitmError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path, max_cache_size);
        }

        let ca = Self::generate(max_cache_size)?;
        ca.save(cert_path, key_path)?;
        Ok(ca)
    }

    fn assemble(
        ca_cert: Certificate,
        ca_key: KeyPair,
        ca_cert_pem: String,
        max_cache_size: usize,
    ) -> Result<Self, MitmError> {
        let leaf_key = KeyPair::generate().map_err(|e| MitmError::ca_generation(e.to_string()))?;
        let cache_size = NonZeroUsize::new(max_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaf_key,
            cache: Mutex::new(LruCache::new(cache_size)),
            max_cache_size,
            cert_ttl: DEFAULT_CERT_TTL,
        })
    }

    pub fn with_ttl(mut self, cert_ttl: Duration) -> Self {
        self.cert_ttl = cert_ttl;
        self
    }

    /// Write the CA certificate and key as PEM
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<(), MitmError> {
        std::fs::write(cert_path.as_ref(), &self.ca_cert_pem)?;
        std::fs::write(key_path.as_ref(), self.ca_key.serialize_pem())?;
        info!(path = %cert_path.as_ref().display(), "Saved CA certificate");
        Ok(())
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Sign a leaf for `hostname` with the shared leaf key
    fn generate_certificate(&self, hostname: &str) -> Result<CertificateDer<'static>, MitmError> {
        if hostname.is_empty() {
            return Err(MitmError::InvalidDomain(hostname.to_string()));
        }

        // IP literals become IP SANs, everything else a DNS SAN
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| MitmError::cert_generation(hostname, e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        // Leaves are valid for 90 days
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(generate_serial_number().into());

        let cert = params
            .signed_by(&self.leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| MitmError::cert_generation(hostname, e.to_string()))?;

        Ok(cert.der().clone())
    }

    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), self.max_cache_size)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

#[async_trait]
impl CertificateIssuer for CertificateAuthority {
    async fn issue_certificate(&self, hostname: &str) -> Result<CertificateDer<'static>, MitmError> {
        let key = hostname.to_ascii_lowercase();

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.is_expired(self.cert_ttl) {
                    debug!(host = %key, "Certificate cache hit but expired, regenerating");
                    cache.pop(&key);
                } else {
                    debug!(host = %key, "Certificate cache hit");
                    return Ok(cached.cert.clone());
                }
            }
        }

        // Lock released while signing
        debug!(host = %key, "Generating new certificate");
        let cert = self.generate_certificate(&key)?;

        self.cache.lock().await.put(
            key,
            CachedCertificate {
                cert: cert.clone(),
                created_at: Instant::now(),
            },
        );

        Ok(cert)
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.serialize_der()))
    }
}

/// Unique serial number from crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}
