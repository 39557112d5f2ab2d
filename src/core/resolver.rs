//! Pluggable name resolvers.
//!
//! A [`Resolver`] turns a host name into addresses. Implementations may opt
//! out of a query by returning [`ResolveError::Invalid`]; the resolution
//! service then passes the address through untouched.
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use scc::HashMap;

use crate::{
    config::models::{PreferFamily, ResolverConfig, ResolverKind},
    core::error::ResolveError,
};

/// DNS-like resolution strategy.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Address family requested through a network name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    Any,
    V4,
    V6,
}

impl IpFamily {
    /// Map `ip`/`tcp4`/`udp6`... onto a family. Unknown networks yield `None`.
    pub fn from_network(network: &str) -> Option<Self> {
        match network {
            "" | "ip" | "tcp" | "udp" => Some(IpFamily::Any),
            "ip4" | "tcp4" | "udp4" => Some(IpFamily::V4),
            "ip6" | "tcp6" | "udp6" => Some(IpFamily::V6),
            _ => None,
        }
    }

    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            IpFamily::Any => true,
            IpFamily::V4 => ip.is_ipv4(),
            IpFamily::V6 => ip.is_ipv6(),
        }
    }
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Default)]
pub struct SystemResolver {
    prefer: Option<PreferFamily>,
}

impl SystemResolver {
    pub fn new(prefer: Option<PreferFamily>) -> Self {
        Self { prefer }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let family = IpFamily::from_network(network).ok_or(ResolveError::Invalid)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(if family.accepts(&ip) { vec![ip] } else { vec![] });
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if family.accepts(&ip) && !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        match self.prefer {
            Some(PreferFamily::Ipv4) => ips.sort_by_key(|ip| !ip.is_ipv4()),
            Some(PreferFamily::Ipv6) => ips.sort_by_key(|ip| !ip.is_ipv6()),
            None => {}
        }
        Ok(ips)
    }
}

/// Restricts an inner resolver to a set of domain suffixes.
pub struct ScopedResolver {
    domains: Vec<String>,
    inner: Arc<dyn Resolver>,
}

impl ScopedResolver {
    pub fn new(domains: Vec<String>, inner: Arc<dyn Resolver>) -> Self {
        let domains = domains
            .into_iter()
            .map(|d| d.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains, inner }
    }

    fn in_scope(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }
}

#[async_trait]
impl Resolver for ScopedResolver {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if !self.in_scope(host) {
            return Err(ResolveError::Invalid);
        }
        self.inner.resolve(network, host).await
    }
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

/// Positive-result cache in front of an inner resolver.
pub struct CachingResolver {
    ttl: Duration,
    inner: Arc<dyn Resolver>,
    cache: HashMap<(String, String), CacheEntry>,
}

impl CachingResolver {
    pub fn new(ttl: Duration, inner: Arc<dyn Resolver>) -> Self {
        Self {
            ttl,
            inner,
            cache: HashMap::new(),
        }
    }

    /// Number of cached (possibly expired) entries
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let key = (network.to_string(), host.to_ascii_lowercase());
        let now = Instant::now();

        if let Some(ips) = self
            .cache
            .get_async(&key)
            .await
            .and_then(|entry| (entry.expires_at > now).then(|| entry.ips.clone()))
        {
            tracing::trace!(host, "resolver cache hit");
            return Ok(ips);
        }

        let ips = self.inner.resolve(network, host).await?;
        if !ips.is_empty() {
            let entry = CacheEntry {
                ips: ips.clone(),
                expires_at: now + self.ttl,
            };
            self.cache.entry_async(key).await.insert_entry(entry);
        }
        Ok(ips)
    }
}

/// Factory for creating resolvers from configuration
pub struct ResolverFactory;

impl ResolverFactory {
    pub fn create(config: &ResolverConfig) -> Result<Arc<dyn Resolver>, String> {
        let mut resolver: Arc<dyn Resolver> = match config.kind {
            ResolverKind::System => Arc::new(SystemResolver::new(config.prefer)),
        };

        if let Some(ttl) = &config.ttl {
            let ttl = humantime::parse_duration(ttl)
                .map_err(|e| format!("Invalid ttl '{ttl}' for resolver {}: {e}", config.name))?;
            if !ttl.is_zero() {
                resolver = Arc::new(CachingResolver::new(ttl, resolver));
            }
        }

        if !config.domains.is_empty() {
            resolver = Arc::new(ScopedResolver::new(config.domains.clone(), resolver));
        }

        tracing::info!(
            "Creating resolver: name={}, kind={:?}, prefer={:?}, ttl={:?}, domains={}",
            config.name,
            config.kind,
            config.prefer,
            config.ttl,
            config.domains.len()
        );
        Ok(resolver)
    }
}
