//! Address matching with CIDR, IP, domain suffix and glob support.
//!
//! Shared by the bypass matchers and the admission controllers. A pattern
//! list is compiled once into an [`AddrMatcher`]; matching is read-only and
//! safe to share between connection tasks.
use std::{net::IpAddr, str::FromStr};

use regex::Regex;

/// CIDR network representation
#[derive(Debug, Clone)]
pub struct IpNetwork {
    /// Base IP address
    addr: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a new IP network from an address and prefix length
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        match addr {
            IpAddr::V4(_) if prefix_len > 32 => {
                return Err("IPv4 prefix length must be <= 32".to_string());
            }
            IpAddr::V6(_) if prefix_len > 128 => {
                return Err("IPv6 prefix length must be <= 128".to_string());
            }
            _ => {}
        }

        Ok(Self { addr, prefix_len })
    }

    /// Parse from CIDR notation (e.g., "192.168.1.0/24"); a bare IP is a host network.
    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len: u8 = prefix_str
                .parse()
                .map_err(|e| format!("Invalid prefix length: {e}"))?;
            Self::new(addr, prefix_len)
        } else {
            let addr = IpAddr::from_str(s).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    /// Check if an IP address is contained in this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            // IPv4-mapped IPv6 peers are compared against IPv4 networks
            (IpAddr::V4(_), IpAddr::V6(addr)) => addr
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

/// Compiled list of address patterns.
#[derive(Debug, Clone, Default)]
pub struct AddrMatcher {
    networks: Vec<IpNetwork>,
    hosts: Vec<String>,
    suffixes: Vec<String>,
    globs: Vec<Regex>,
}

impl AddrMatcher {
    /// Compile a list of patterns.
    ///
    /// Accepted forms: `10.0.0.0/8`, `192.168.1.1`, `::1`, `example.com`,
    /// `.example.com` (the domain and all subdomains) and `*.example.*` globs.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, String> {
        let mut matcher = AddrMatcher::default();
        for pattern in patterns {
            matcher.add(pattern.as_ref())?;
        }
        Ok(matcher)
    }

    fn add(&mut self, pattern: &str) -> Result<(), String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(());
        }

        if pattern.contains('/') {
            self.networks.push(IpNetwork::parse(pattern)?);
        } else if let Ok(network) = IpNetwork::parse(pattern) {
            self.networks.push(network);
        } else if let Some(suffix) = pattern.strip_prefix('.') {
            self.suffixes.push(suffix.to_ascii_lowercase());
        } else if pattern.contains('*') || pattern.contains('?') {
            self.globs.push(glob_to_regex(pattern)?);
        } else {
            self.hosts.push(pattern.to_ascii_lowercase());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
            && self.hosts.is_empty()
            && self.suffixes.is_empty()
            && self.globs.is_empty()
    }

    /// Number of compiled patterns
    pub fn len(&self) -> usize {
        self.networks.len() + self.hosts.len() + self.suffixes.len() + self.globs.len()
    }

    /// Match a bare host (IP literal or name, no port).
    pub fn matches(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }

        if let Ok(ip) = IpAddr::from_str(host) {
            return self.matches_ip(ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if self.hosts.iter().any(|h| *h == host) {
            return true;
        }
        if self.suffixes.iter().any(|suffix| {
            host == *suffix
                || (host.len() > suffix.len()
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        }) {
            return true;
        }
        self.globs.iter().any(|re| re.is_match(&host))
    }

    /// Match an IP against the network patterns
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.to_ascii_lowercase().chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| format!("Invalid pattern '{pattern}': {e}"))
}
