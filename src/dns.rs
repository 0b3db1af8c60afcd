//! Origin name resolution
//!
//! The fetcher only needs one address per host. `SystemResolver` uses the
//! system DNS configuration with a small LRU cache in front of it;
//! `StaticResolver` pins names to fixed addresses.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Hostname to address lookup
#[async_trait]
pub trait Resolver: Send + Sync {
    /// First address for `host`, or `None` if it cannot be resolved
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

struct CachedResolution {
    ip: IpAddr,
    resolved_at: Instant,
}

/// Resolver backed by the system DNS configuration
pub struct SystemResolver {
    resolver: Arc<TokioAsyncResolver>,
    cache: Mutex<LruCache<String, CachedResolution>>,
    cache_ttl: Duration,
    resolver_timeout: Duration,
}

impl SystemResolver {
    pub fn new(cache_size: usize, cache_ttl_seconds: u64, resolver_timeout_seconds: u64) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(resolver_timeout_seconds);
        opts.attempts = 2;

        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            warn!("Failed to load system DNS config, falling back to Google DNS");
            TokioAsyncResolver::tokio(ResolverConfig::google(), opts)
        });

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            resolver: Arc::new(resolver),
            cache: Mutex::new(LruCache::new(cache_size)),
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
            resolver_timeout: Duration::from_secs(resolver_timeout_seconds),
        }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(host) {
                if cached.resolved_at.elapsed() < self.cache_ttl {
                    debug!(host = %host, ip = %cached.ip, "DNS cache hit");
                    return Some(cached.ip);
                }
            }
        }

        // Lock released during the lookup
        let ip = match timeout(self.resolver_timeout, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => lookup.iter().next(),
            Ok(Err(e)) => {
                warn!(host = %host, error = %e, "DNS resolution failed");
                None
            }
            Err(_) => {
                warn!(host = %host, "DNS resolution timeout");
                None
            }
        }?;

        debug!(host = %host, ip = %ip, "Resolved");
        self.cache.lock().await.put(
            host.to_string(),
            CachedResolution {
                ip,
                resolved_at: Instant::now(),
            },
        );
        Some(ip)
    }
}

/// Fixed name-to-address table. IP literals always resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        self.hosts.get(&host.to_ascii_lowercase()).copied()
    }
}
