use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::dispatch::DispatchOptions;

#[derive(Debug, Clone)]
pub struct Config {
    // Listeners
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,

    // Archive and dispatch
    pub archive_path: PathBuf,
    pub record_mode: bool,
    pub use_closest_match: bool,
    pub diff_unknown_requests: bool,
    pub inject_scripts: Vec<String>,
    pub use_delays: bool,
    pub cache_miss_log_path: Option<PathBuf>,

    // Certificate authority
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub cert_cache_size: usize,

    // Origin fetches
    pub fetch_attempts: u32,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub max_response_body_size: usize,
    pub upstream_tls_insecure: bool,

    // DNS configuration
    pub dns_cache_size: usize,
    pub dns_cache_ttl_seconds: u64,
    pub dns_resolver_timeout_seconds: u64,

    // Logging
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8080,
            https_port: 8443,
            archive_path: PathBuf::from("archive.json"),
            record_mode: false,
            use_closest_match: false,
            diff_unknown_requests: false,
            inject_scripts: vec!["deterministic.js".to_string()],
            use_delays: false,
            cache_miss_log_path: None,
            ca_cert_path: PathBuf::from("webreplay-ca.pem"),
            ca_key_path: PathBuf::from("webreplay-ca.key"),
            cert_cache_size: 1000,
            fetch_attempts: 3,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
            max_response_body_size: 104857600, // 100MB
            upstream_tls_insecure: false,
            dns_cache_size: 5000,
            dns_cache_ttl_seconds: 60,
            dns_resolver_timeout_seconds: 5,
            log_json: false,
        }
    }
}

/// Parse `name` from the environment, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let host = env::var("PROXY_HOST").unwrap_or(defaults.host);

        // Comma separated; an empty value disables injection
        let inject_scripts = match env::var("INJECT_SCRIPTS") {
            Ok(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.inject_scripts,
        };

        let cache_miss_log_path = env::var("CACHE_MISS_LOG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let config = Config {
            host,
            http_port: env_or("HTTP_PORT", defaults.http_port)?,
            https_port: env_or("HTTPS_PORT", defaults.https_port)?,
            archive_path: env_or("ARCHIVE_PATH", defaults.archive_path)?,
            record_mode: env_or("RECORD_MODE", defaults.record_mode)?,
            use_closest_match: env_or("USE_CLOSEST_MATCH", defaults.use_closest_match)?,
            diff_unknown_requests: env_or("DIFF_UNKNOWN_REQUESTS", defaults.diff_unknown_requests)?,
            inject_scripts,
            use_delays: env_or("USE_DELAYS", defaults.use_delays)?,
            cache_miss_log_path,
            ca_cert_path: env_or("CA_CERT_PATH", defaults.ca_cert_path)?,
            ca_key_path: env_or("CA_KEY_PATH", defaults.ca_key_path)?,
            cert_cache_size: env_or("CERT_CACHE_SIZE", defaults.cert_cache_size)?,
            fetch_attempts: env_or("FETCH_ATTEMPTS", defaults.fetch_attempts)?,
            connect_timeout_seconds: env_or("CONNECT_TIMEOUT_SECONDS", defaults.connect_timeout_seconds)?,
            read_timeout_seconds: env_or("READ_TIMEOUT_SECONDS", defaults.read_timeout_seconds)?,
            write_timeout_seconds: env_or("WRITE_TIMEOUT_SECONDS", defaults.write_timeout_seconds)?,
            max_response_body_size: env_or("MAX_RESPONSE_BODY_SIZE", defaults.max_response_body_size)?,
            upstream_tls_insecure: env_or("UPSTREAM_TLS_INSECURE", defaults.upstream_tls_insecure)?,
            dns_cache_size: env_or("DNS_CACHE_SIZE", defaults.dns_cache_size)?,
            dns_cache_ttl_seconds: env_or("DNS_CACHE_TTL_SECONDS", defaults.dns_cache_ttl_seconds)?,
            dns_resolver_timeout_seconds: env_or(
                "DNS_RESOLVER_TIMEOUT_SECONDS",
                defaults.dns_resolver_timeout_seconds,
            )?,
            log_json: env_or("LOG_JSON", defaults.log_json)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_attempts == 0 {
            return Err(anyhow::anyhow!("FETCH_ATTEMPTS must be at least 1"));
        }

        if self.http_port == self.https_port {
            return Err(anyhow::anyhow!(
                "HTTP_PORT and HTTPS_PORT must differ (both {})",
                self.http_port
            ));
        }

        if self.use_closest_match && self.record_mode {
            tracing::warn!("USE_CLOSEST_MATCH only applies in replay mode");
        }

        Ok(())
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    pub fn https_addr(&self) -> String {
        format!("{}:{}", self.host, self.https_port)
    }

    pub fn dispatch_options(&self, inject_script: Option<String>) -> DispatchOptions {
        DispatchOptions {
            use_record_mode: self.record_mode,
            use_closest_match: self.use_closest_match,
            diff_unknown_requests: self.diff_unknown_requests,
            inject_script,
        }
    }
}
